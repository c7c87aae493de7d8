//! The contract the engine requires of its durable store.
//!
//! Reads return raw rows so callers can detect cardinality defects. Every
//! write is all-or-nothing: a failed call leaves no visible change.

use crate::definition::{MachineDefinition, MachineRecord, StateDef, TransitionDef};
use crate::history::{HistoryEntry, NewHistoryEntry};
use crate::instance::{Instance, InstanceId, MachineId, NewInstance};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A compare-and-set precondition did not hold.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Backend(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for definitions, instances and history.
#[async_trait]
pub trait Store: Send + Sync {
    /// All machines registered under `name`.
    async fn machines_named(&self, name: &str) -> StoreResult<Vec<MachineRecord>>;

    /// All machines, ordered by name.
    async fn list_machines(&self) -> StoreResult<Vec<MachineRecord>>;

    /// Registers a machine with its states and transitions.
    async fn insert_machine(&self, definition: &MachineDefinition) -> StoreResult<MachineId>;

    /// States of a machine in declaration order.
    async fn states_of(&self, machine: MachineId) -> StoreResult<Vec<StateDef>>;

    /// Transitions of a machine in declaration order.
    async fn transitions_of(&self, machine: MachineId) -> StoreResult<Vec<TransitionDef>>;

    /// Transitions of a machine leaving `from_state`, in declaration order.
    async fn transitions_from(
        &self,
        machine: MachineId,
        from_state: &str,
    ) -> StoreResult<Vec<TransitionDef>>;

    /// Live instances matching the key.
    async fn find_instances(
        &self,
        machine: MachineId,
        external_name: &str,
        external_id: &str,
    ) -> StoreResult<Vec<Instance>>;

    /// Inserts an instance and its initiation entry as one unit.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if a live instance
    /// already holds the key.
    async fn create_instance(
        &self,
        instance: &NewInstance,
        initiation: &NewHistoryEntry,
    ) -> StoreResult<Instance>;

    /// Moves an instance to `entry.state` and appends `entry` as one unit.
    ///
    /// Applies only if the instance is still in `expected_state`,
    /// otherwise fails with [`StoreError::Conflict`].
    async fn commit_transition(
        &self,
        instance: InstanceId,
        expected_state: &str,
        entry: &NewHistoryEntry,
    ) -> StoreResult<()>;

    /// Hard-deletes an instance. History rows are kept.
    async fn delete_instance(&self, instance: InstanceId) -> StoreResult<()>;

    /// History of an instance, oldest first.
    async fn history_of(&self, instance: InstanceId) -> StoreResult<Vec<HistoryEntry>>;

    /// Releases backend resources.
    async fn close(&self) {}
}
