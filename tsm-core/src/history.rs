//! Append-only audit trail of instance state changes.

use crate::error::CoreError;
use crate::instance::InstanceId;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transition name (and comment) recorded when an instance is created.
pub const INSTANCE_INITIATED: &str = "instance initiated";

/// One recorded state change. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,

    /// The instance this entry belongs to. May no longer exist.
    pub instance_id: InstanceId,

    /// State the instance was left in.
    pub state: String,

    /// Transition applied, or [`INSTANCE_INITIATED`].
    pub transition: String,

    /// Who made the change.
    pub actor: String,

    pub comment: String,

    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn is_initiation(&self) -> bool {
        self.transition == INSTANCE_INITIATED
    }
}

/// An entry waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub state: String,
    pub transition: String,
    pub actor: String,
    pub comment: String,
}

impl NewHistoryEntry {
    /// Entry recording the creation of an instance in `initial_state`.
    pub fn initiated(initial_state: impl Into<String>, initiated_by: impl Into<String>) -> Self {
        Self {
            state: initial_state.into(),
            transition: INSTANCE_INITIATED.to_string(),
            actor: initiated_by.into(),
            comment: INSTANCE_INITIATED.to_string(),
        }
    }

    /// Entry recording a named transition into `state`.
    pub fn transition(
        state: impl Into<String>,
        transition: impl Into<String>,
        actor: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            state: state.into(),
            transition: transition.into(),
            actor: actor.into(),
            comment: comment.into(),
        }
    }
}

/// Read side of the history ledger.
///
/// Appends ride along with instance writes (see
/// [`InstanceStore`](crate::instance::InstanceStore)) so that state and
/// history can never diverge.
pub struct HistoryLedger<'a> {
    store: &'a dyn Store,
}

impl<'a> HistoryLedger<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// All entries for an instance, oldest first.
    pub async fn list_for(&self, instance: InstanceId) -> Result<Vec<HistoryEntry>, CoreError> {
        Ok(self.store.history_of(instance).await?)
    }
}
