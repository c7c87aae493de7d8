//! # tsm-storage
//!
//! Storage layer for tsm.
//!
//! This crate provides:
//! - Backend selection ([`open_store`])
//! - The PostgreSQL store (feature `postgres`)
//! - Loading and provisioning machine definition files

pub mod backend;
pub mod definitions;
pub mod error;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use backend::{open_store, StoreOptions};
pub use definitions::{load_definition, provision};
pub use error::StorageError;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
