//! Instance records and the instance store.

use crate::definition::MachineRecord;
use crate::error::CoreError;
use crate::history::NewHistoryEntry;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned machine identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub i64);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned instance identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub i64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The caller-facing key of an instance: an external entity on a machine.
///
/// At most one live instance exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub external_name: String,
    pub external_id: String,
    pub machine: String,
}

impl InstanceKey {
    pub fn new(
        external_name: impl Into<String>,
        external_id: impl Into<String>,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            external_name: external_name.into(),
            external_id: external_id.into(),
            machine: machine.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} on '{}'",
            self.external_name, self.external_id, self.machine
        )
    }
}

/// A live run of a machine for one external entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,

    /// Owning machine.
    pub machine_id: MachineId,

    pub external_name: String,

    pub external_id: String,

    /// Current state in the machine.
    pub state: String,

    /// Who initiated the instance.
    pub initiated_by: String,

    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub machine_id: MachineId,
    pub external_name: String,
    pub external_id: String,
    pub state: String,
    pub initiated_by: String,
}

impl NewInstance {
    pub fn new(
        machine: &MachineRecord,
        key: &InstanceKey,
        state: impl Into<String>,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine.id,
            external_name: key.external_name.clone(),
            external_id: key.external_id.clone(),
            state: state.into(),
            initiated_by: initiated_by.into(),
        }
    }
}

/// Lookup and mutation of live instances.
///
/// Every write is a single store call. Creation and state changes carry
/// their history entry so the store can apply both as one unit.
pub struct InstanceStore<'a> {
    store: &'a dyn Store,
}

impl<'a> InstanceStore<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Finds the single live instance for `key`.
    pub async fn find(
        &self,
        machine: &MachineRecord,
        key: &InstanceKey,
    ) -> Result<Instance, CoreError> {
        let mut rows = self
            .store
            .find_instances(machine.id, &key.external_name, &key.external_id)
            .await?;

        match rows.len() {
            0 => Err(CoreError::InstanceNotFound { key: key.clone() }),
            1 => Ok(rows.remove(0)),
            count => {
                tracing::warn!(%key, count, "more than one live instance for key");
                Err(CoreError::AmbiguousInstance {
                    key: key.clone(),
                    count,
                })
            }
        }
    }

    /// Inserts a new live instance together with its initiation entry.
    ///
    /// A store-level uniqueness violation means another caller won the
    /// race for this key.
    pub async fn create(
        &self,
        key: &InstanceKey,
        instance: &NewInstance,
        initiation: &NewHistoryEntry,
    ) -> Result<Instance, CoreError> {
        self.store
            .create_instance(instance, initiation)
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => CoreError::ExistingInstanceFound { key: key.clone() },
                other => other.into(),
            })
    }

    /// Sets the instance to `entry.state` and appends `entry`.
    ///
    /// Fails with `StateConflict` if the instance left `instance.state`
    /// since it was read.
    pub async fn set_state(
        &self,
        key: &InstanceKey,
        instance: &Instance,
        entry: &NewHistoryEntry,
    ) -> Result<(), CoreError> {
        self.store
            .commit_transition(instance.id, &instance.state, entry)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => CoreError::StateConflict {
                    key: key.clone(),
                    expected: instance.state.clone(),
                },
                StoreError::NotFound(_) => CoreError::InstanceNotFound { key: key.clone() },
                other => other.into(),
            })
    }

    /// Removes the instance row. Its history is retained.
    pub async fn delete(&self, key: &InstanceKey, instance: &Instance) -> Result<(), CoreError> {
        self.store
            .delete_instance(instance.id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => CoreError::InstanceNotFound { key: key.clone() },
                other => other.into(),
            })
    }
}
