//! # tsm-server
//!
//! TCP server for tsm.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Protocol framing and message dispatch
//! - Session management
//! - Command handlers for every operation of the state machine service
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;

pub use config::{
    Config, ConfigError, NetworkConfig, PostgresConfig, StorageConfig, StoreBackend, CONFIG_ENV,
};
pub use error::ServerError;
pub use handler::{CommandHandler, ServerInfo};
pub use server::{Server, ServerConfig, ServerStats, StatsSnapshot};
pub use session::{Handshake, Session, SessionCounters, SessionState};
