//! # tsm-client
//!
//! Client library for tsm.
//!
//! This crate provides:
//! - Async TCP client with request multiplexing
//! - Typed API for every server operation
//! - Pre and post transition tasks run on the client side

pub mod client;
pub mod connection;
pub mod error;
pub mod tasks;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use tasks::{
    TaskError, TaskFailure, TaskOutcome, TaskRegistry, TaskRunner, TransitionContext,
    TransitionTask,
};
