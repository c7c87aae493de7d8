//! # tsm-core
//!
//! State machine engine for tsm.
//!
//! This crate provides:
//! - Machine definition parsing and validation
//! - The definition registry, instance store and history ledger
//! - Transition validation
//! - The service facade every transport calls
//! - The store contract and an in-memory store

pub mod definition;
pub mod engine;
pub mod error;
pub mod history;
pub mod instance;
pub mod memory;
pub mod registry;
pub mod service;
pub mod store;

pub use definition::{MachineDefinition, MachineRecord, StateDef, StateKind, TransitionDef};
pub use engine::{TransitionEngine, TransitionPlan, MAX_COMMENT_LEN};
pub use error::{CoreError, ErrorKind};
pub use history::{HistoryEntry, HistoryLedger, NewHistoryEntry, INSTANCE_INITIATED};
pub use instance::{Instance, InstanceId, InstanceKey, InstanceStore, MachineId, NewInstance};
pub use memory::MemoryStore;
pub use registry::DefinitionRegistry;
pub use service::{InstanceHistory, PutMachineOutcome, StateMachineService, TransitionOutcome};
pub use store::{Store, StoreError, StoreResult};
