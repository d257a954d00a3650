use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use idempotency_server::config::{FileConfig, ServerConfig};
use idempotency_server::Server;

#[derive(Parser, Debug)]
#[command(name = "idempotency-server")]
struct Args {
    /// Address to bind the HTTP listener on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Path to a JSON file configuring the storage backend and middleware tuning.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let file_config: FileConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => FileConfig { backend: Default::default(), middleware: Default::default() },
    };

    let config = ServerConfig {
        address: args.bind,
        backend: file_config.backend,
        middleware: file_config.middleware.into_middleware_config(),
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            println!("Listening on {}", addr);
        }
    });

    Server::new(config).run(ready_tx).await?;
    Ok(())
}
