//! Demo HTTP service: a `POST /payments` endpoint fronted by the idempotency
//! middleware, backed by a configurable [`idempotency_core::Store`].

pub mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use idempotency_axum::IdempotencyState;
use idempotency_core::{Store, Sweeper};
use serde::{Deserialize, Serialize};

pub use config::ServerConfig;

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: u64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    pub id: String,
    pub amount: u64,
    pub currency: String,
}

/// State shared by the demo route. Holds only what the handler itself
/// needs — the idempotency bookkeeping lives entirely in the middleware's
/// own `IdempotencyState`, installed as a separate layer.
#[derive(Clone)]
pub struct AppState {
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new() -> Self {
        Self { next_id: Arc::new(AtomicU64::new(1)) }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

async fn create_payment(State(state): State<AppState>, Json(request): Json<CreatePaymentRequest>) -> Response {
    if request.amount == 0 {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "amount must be positive" }))).into_response();
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let response = CreatePaymentResponse {
        id: format!("pay_{id}"),
        amount: request.amount,
        currency: request.currency.unwrap_or_else(|| "USD".to_string()),
    };
    (StatusCode::CREATED, Json(response)).into_response()
}

/// The idempotency-fronted payments demo server. Mirrors the shape the
/// teacher's own `Server` used: a config struct, a `create_router`
/// associated function, and a `run` method that signals readiness through a
/// one-shot channel before serving.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    pub fn create_router(store: Arc<dyn Store>, middleware: idempotency_axum::MiddlewareConfig) -> Router {
        let idempotency_state = IdempotencyState::new(store, middleware);
        Router::new()
            .route("/payments", post(create_payment))
            .layer(axum::middleware::from_fn_with_state(idempotency_state, idempotency_axum::idempotency_layer))
            .with_state(AppState::new())
    }

    pub async fn run(self, ready_tx: tokio::sync::oneshot::Sender<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
        let store = self.config.backend.build().await?;
        let sweeper = Arc::new(Sweeper::new(store.clone(), 100));
        let _sweeper_handle = sweeper.spawn(config::DEFAULT_CLEANUP_INTERVAL);

        let app = Self::create_router(store, self.config.middleware.clone());
        let listener = tokio::net::TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;
        ready_tx.send(local_addr).ok();
        tracing::info!(address = %local_addr, "idempotency-server listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
