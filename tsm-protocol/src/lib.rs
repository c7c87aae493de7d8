//! # tsm-protocol
//!
//! Wire protocol for tsm.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON request/response envelopes
//! - Typed parameters and results for every operation
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FrameHeader, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Operation, Request, Response, ResponseError, ResponseStatus};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the tsm server.
pub const DEFAULT_PORT: u16 = 7450;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
