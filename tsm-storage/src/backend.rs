//! Store backend selection.

use crate::error::StorageError;
use std::sync::Arc;
use tsm_core::{MemoryStore, Store};

/// Which store to open and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOptions {
    /// Volatile in-process store.
    Memory,
    /// PostgreSQL database.
    Postgres {
        url: String,
        max_connections: u32,
        connect_timeout_secs: u64,
    },
}

impl StoreOptions {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreOptions::Memory => "memory",
            StoreOptions::Postgres { .. } => "postgres",
        }
    }

    /// Whether this build can open the backend.
    pub fn is_available(&self) -> bool {
        match self {
            StoreOptions::Memory => true,
            StoreOptions::Postgres { .. } => cfg!(feature = "postgres"),
        }
    }
}

/// Opens the configured store.
pub async fn open_store(options: &StoreOptions) -> Result<Arc<dyn Store>, StorageError> {
    match options {
        StoreOptions::Memory => {
            tracing::info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StoreOptions::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = crate::postgres::PostgresStore::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await?;
            tracing::info!(max_connections, "connected to postgres store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreOptions::Postgres { .. } => Err(StorageError::Unsupported("postgres")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StoreOptions::Memory).await.unwrap();
        assert!(store.list_machines().await.unwrap().is_empty());
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_postgres_requires_feature() {
        let options = StoreOptions::Postgres {
            url: "postgres://localhost/tsm".into(),
            max_connections: 4,
            connect_timeout_secs: 1,
        };
        let result = open_store(&options).await;
        assert!(matches!(result, Err(StorageError::Unsupported("postgres"))));
    }
}
