//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid definition in '{path}': {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: tsm_core::CoreError,
    },

    #[error("backend '{0}' is not available in this build")]
    Unsupported(&'static str),

    #[error("store error: {0}")]
    Store(#[from] tsm_core::StoreError),

    #[error("core error: {0}")]
    Core(#[from] tsm_core::CoreError),
}
