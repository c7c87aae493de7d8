//! Core error types.

use crate::instance::InstanceKey;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The kind of failure an operation was rejected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    AmbiguousDefinition,
    AmbiguousInstance,
    MultipleInitialStates,
    ExistingInstanceFound,
    TransitionNotAllowed,
    CommentTooLong,
    NoInitialState,
    StateConflict,
    InvalidDefinition,
    MachineExists,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AmbiguousDefinition => "AMBIGUOUS_DEFINITION",
            ErrorKind::AmbiguousInstance => "AMBIGUOUS_INSTANCE",
            ErrorKind::MultipleInitialStates => "MULTIPLE_INITIAL_STATES",
            ErrorKind::ExistingInstanceFound => "EXISTING_INSTANCE_FOUND",
            ErrorKind::TransitionNotAllowed => "TRANSITION_NOT_ALLOWED",
            ErrorKind::CommentTooLong => "COMMENT_TOO_LONG",
            ErrorKind::NoInitialState => "NO_INITIAL_STATE",
            ErrorKind::StateConflict => "STATE_CONFLICT",
            ErrorKind::InvalidDefinition => "INVALID_DEFINITION",
            ErrorKind::MachineExists => "MACHINE_EXISTS",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Data-integrity defects: more rows than an invariant allows.
    pub fn is_integrity_defect(&self) -> bool {
        matches!(
            self,
            ErrorKind::AmbiguousDefinition
                | ErrorKind::AmbiguousInstance
                | ErrorKind::MultipleInitialStates
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("machine not found: {machine}")]
    MachineNotFound { machine: String },

    #[error("instance not found: {key}")]
    InstanceNotFound { key: InstanceKey },

    #[error("ambiguous definition: {count} machines named '{machine}'")]
    AmbiguousDefinition { machine: String, count: usize },

    #[error("ambiguous instance: {count} live instances for {key}")]
    AmbiguousInstance { key: InstanceKey, count: usize },

    #[error("machine '{machine}' has no initial state")]
    NoInitialState { machine: String },

    #[error("machine '{machine}' has {count} initial states")]
    MultipleInitialStates { machine: String, count: usize },

    #[error("instance already exists: {key}")]
    ExistingInstanceFound { key: InstanceKey },

    #[error("transition '{transition}' not allowed from state '{state}'")]
    TransitionNotAllowed { state: String, transition: String },

    #[error("comment too long: {len} characters, at most {max}")]
    CommentTooLong { len: usize, max: usize },

    #[error("state conflict on {key}: expected '{expected}'")]
    StateConflict { key: InstanceKey, expected: String },

    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("machine already exists with different content: {machine}")]
    MachineExists { machine: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Maps this error onto the public failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MachineNotFound { .. } => ErrorKind::NotFound,
            CoreError::InstanceNotFound { .. } => ErrorKind::NotFound,
            CoreError::AmbiguousDefinition { .. } => ErrorKind::AmbiguousDefinition,
            CoreError::AmbiguousInstance { .. } => ErrorKind::AmbiguousInstance,
            CoreError::NoInitialState { .. } => ErrorKind::NoInitialState,
            CoreError::MultipleInitialStates { .. } => ErrorKind::MultipleInitialStates,
            CoreError::ExistingInstanceFound { .. } => ErrorKind::ExistingInstanceFound,
            CoreError::TransitionNotAllowed { .. } => ErrorKind::TransitionNotAllowed,
            CoreError::CommentTooLong { .. } => ErrorKind::CommentTooLong,
            CoreError::StateConflict { .. } => ErrorKind::StateConflict,
            CoreError::InvalidDefinition { .. } => ErrorKind::InvalidDefinition,
            CoreError::MachineExists { .. } => ErrorKind::MachineExists,
            CoreError::Store(_) => ErrorKind::UnknownError,
        }
    }

    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StateConflict { .. })
            || matches!(self, CoreError::Store(e) if e.is_retryable())
    }
}
