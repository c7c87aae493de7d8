//! Server error types.

use tsm_core::ErrorKind;
use tsm_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tsm_protocol::ProtocolError),

    #[error(transparent)]
    Core(#[from] tsm_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] tsm_storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::UnknownError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Core(e) => match e.kind() {
                ErrorKind::NotFound => ErrorCode::NotFound,
                ErrorKind::AmbiguousDefinition => ErrorCode::AmbiguousDefinition,
                ErrorKind::AmbiguousInstance => ErrorCode::AmbiguousInstance,
                ErrorKind::MultipleInitialStates => ErrorCode::MultipleInitialStates,
                ErrorKind::ExistingInstanceFound => ErrorCode::ExistingInstanceFound,
                ErrorKind::TransitionNotAllowed => ErrorCode::TransitionNotAllowed,
                ErrorKind::CommentTooLong => ErrorCode::CommentTooLong,
                ErrorKind::NoInitialState => ErrorCode::NoInitialState,
                ErrorKind::StateConflict => ErrorCode::StateConflict,
                ErrorKind::InvalidDefinition => ErrorCode::InvalidDefinition,
                ErrorKind::MachineExists => ErrorCode::MachineExists,
                ErrorKind::UnknownError => ErrorCode::UnknownError,
            },
            ServerError::Storage(_) => ErrorCode::UnknownError,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::ShuttingDown => ErrorCode::UnknownError,
        }
    }

    /// Store rows that break a uniqueness invariant.
    pub fn is_integrity_defect(&self) -> bool {
        matches!(self, ServerError::Core(e) if e.kind().is_integrity_defect())
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Core(e) => e.is_retryable(),
            other => other.error_code().is_retryable(),
        }
    }
}
