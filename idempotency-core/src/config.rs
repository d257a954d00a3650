use std::sync::Arc;

use idempotency_common::Result;
use serde::{Deserialize, Serialize};

use crate::store::memory::MemoryStore;
use crate::store::redis_kv::RedisStore;
use crate::store::sql::SqlStore;
use crate::store::Store;

/// Which backend a deployment wires up, as read from the server's config
/// file. Mirrors the teacher's `ServerConfig`/`NodeRole` pattern of a small,
/// `serde`-deserializable struct assembled in `main.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory {
        #[serde(default)]
        max_records: Option<usize>,
    },
    Redis {
        url: String,
        #[serde(default = "default_redis_namespace")]
        key_namespace: String,
    },
    Sql {
        database_url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_redis_namespace() -> String {
    "idempotency:".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory { max_records: None }
    }
}

impl BackendConfig {
    /// Construct the configured backend, connecting to a remote store if
    /// necessary. For `Sql`, also runs the idempotent `CREATE TABLE IF NOT
    /// EXISTS` migration.
    pub async fn build(&self) -> Result<Arc<dyn Store>> {
        match self {
            BackendConfig::Memory { max_records } => {
                let mut store = MemoryStore::new();
                if let Some(max) = max_records {
                    store = store.with_max_records(*max);
                }
                Ok(Arc::new(store))
            }
            BackendConfig::Redis { url, key_namespace } => {
                let store = RedisStore::connect(url, key_namespace.clone()).await?;
                Ok(Arc::new(store))
            }
            BackendConfig::Sql { database_url, max_connections } => {
                let store = SqlStore::connect(database_url, *max_connections).await?;
                store.migrate().await?;
                Ok(Arc::new(store))
            }
        }
    }
}
