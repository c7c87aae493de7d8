//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'TSMP', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable error codes returned in failed responses.
///
/// Engine failures map one to one onto the engine's failure kinds; the
/// remaining codes belong to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,

    // Lookup errors
    NotFound,
    AmbiguousDefinition,
    AmbiguousInstance,
    MultipleInitialStates,
    NoInitialState,

    // Write errors
    ExistingInstanceFound,
    TransitionNotAllowed,
    CommentTooLong,
    StateConflict,
    InvalidDefinition,
    MachineExists,

    // System errors
    UnknownError,
}

impl ErrorCode {
    /// Returns whether the same request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::StateConflict | ErrorCode::UnknownError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AmbiguousDefinition => "AMBIGUOUS_DEFINITION",
            ErrorCode::AmbiguousInstance => "AMBIGUOUS_INSTANCE",
            ErrorCode::MultipleInitialStates => "MULTIPLE_INITIAL_STATES",
            ErrorCode::NoInitialState => "NO_INITIAL_STATE",
            ErrorCode::ExistingInstanceFound => "EXISTING_INSTANCE_FOUND",
            ErrorCode::TransitionNotAllowed => "TRANSITION_NOT_ALLOWED",
            ErrorCode::CommentTooLong => "COMMENT_TOO_LONG",
            ErrorCode::StateConflict => "STATE_CONFLICT",
            ErrorCode::InvalidDefinition => "INVALID_DEFINITION",
            ErrorCode::MachineExists => "MACHINE_EXISTS",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::StateConflict.is_retryable());
        assert!(ErrorCode::UnknownError.is_retryable());

        assert!(!ErrorCode::BadRequest.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
        assert!(!ErrorCode::ExistingInstanceFound.is_retryable());
        assert!(!ErrorCode::TransitionNotAllowed.is_retryable());
        assert!(!ErrorCode::CommentTooLong.is_retryable());
    }

    #[test]
    fn test_display_matches_serde() {
        for code in [
            ErrorCode::UnsupportedProtocol,
            ErrorCode::BadRequest,
            ErrorCode::NotFound,
            ErrorCode::AmbiguousDefinition,
            ErrorCode::AmbiguousInstance,
            ErrorCode::MultipleInitialStates,
            ErrorCode::NoInitialState,
            ErrorCode::ExistingInstanceFound,
            ErrorCode::TransitionNotAllowed,
            ErrorCode::CommentTooLong,
            ErrorCode::StateConflict,
            ErrorCode::InvalidDefinition,
            ErrorCode::MachineExists,
            ErrorCode::UnknownError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnsupportedVersion(99);
        assert!(err.to_string().contains("99"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        assert!(err.to_string().contains("0xabc"));

        let err = ProtocolError::InvalidFlags(0xFF);
        assert!(err.to_string().contains("0xff"));
    }
}
