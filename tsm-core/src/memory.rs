//! In-memory store.
//!
//! All tables sit behind one lock, so every contract call is atomic.

use crate::definition::{MachineDefinition, MachineRecord, StateDef, TransitionDef};
use crate::history::{HistoryEntry, NewHistoryEntry};
use crate::instance::{Instance, InstanceId, MachineId, NewInstance};
use crate::store::{Store, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Tables {
    machines: BTreeMap<MachineId, MachineRecord>,
    states: Vec<(MachineId, StateDef)>,
    transitions: Vec<(MachineId, TransitionDef)>,
    instances: BTreeMap<InstanceId, Instance>,
    history: Vec<HistoryEntry>,
    next_machine_id: i64,
    next_instance_id: i64,
    next_history_id: i64,
}

impl Tables {
    fn append_history(&mut self, instance_id: InstanceId, entry: &NewHistoryEntry) {
        self.next_history_id += 1;
        self.history.push(HistoryEntry {
            id: self.next_history_id,
            instance_id,
            state: entry.state.clone(),
            transition: entry.transition.clone(),
            actor: entry.actor.clone(),
            comment: entry.comment.clone(),
            recorded_at: Utc::now(),
        });
    }
}

/// Volatile [`Store`] for tests and single-process deployments.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// Whether unique machine names and instance keys are enforced.
    constrained: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            constrained: true,
        }
    }

    /// A store without uniqueness constraints, as a misconfigured backend
    /// would behave.
    pub fn unconstrained() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            constrained: false,
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.tables.read().instances.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn machines_named(&self, name: &str) -> StoreResult<Vec<MachineRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .machines
            .values()
            .filter(|m| m.name == name)
            .cloned()
            .collect())
    }

    async fn list_machines(&self) -> StoreResult<Vec<MachineRecord>> {
        let tables = self.tables.read();
        let mut machines: Vec<_> = tables.machines.values().cloned().collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(machines)
    }

    async fn insert_machine(&self, definition: &MachineDefinition) -> StoreResult<MachineId> {
        let mut tables = self.tables.write();

        if self.constrained && tables.machines.values().any(|m| m.name == definition.name) {
            return Err(StoreError::UniqueViolation(format!(
                "machine '{}' exists",
                definition.name
            )));
        }

        tables.next_machine_id += 1;
        let id = MachineId(tables.next_machine_id);
        tables.machines.insert(
            id,
            MachineRecord {
                id,
                name: definition.name.clone(),
                description: definition.description.clone(),
            },
        );
        for state in &definition.states {
            tables.states.push((id, state.clone()));
        }
        for transition in &definition.transitions {
            tables.transitions.push((id, transition.clone()));
        }

        Ok(id)
    }

    async fn states_of(&self, machine: MachineId) -> StoreResult<Vec<StateDef>> {
        let tables = self.tables.read();
        Ok(tables
            .states
            .iter()
            .filter(|(m, _)| *m == machine)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn transitions_of(&self, machine: MachineId) -> StoreResult<Vec<TransitionDef>> {
        let tables = self.tables.read();
        Ok(tables
            .transitions
            .iter()
            .filter(|(m, _)| *m == machine)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn transitions_from(
        &self,
        machine: MachineId,
        from_state: &str,
    ) -> StoreResult<Vec<TransitionDef>> {
        let tables = self.tables.read();
        Ok(tables
            .transitions
            .iter()
            .filter(|(m, t)| *m == machine && t.from == from_state)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn find_instances(
        &self,
        machine: MachineId,
        external_name: &str,
        external_id: &str,
    ) -> StoreResult<Vec<Instance>> {
        let tables = self.tables.read();
        Ok(tables
            .instances
            .values()
            .filter(|i| {
                i.machine_id == machine
                    && i.external_name == external_name
                    && i.external_id == external_id
            })
            .cloned()
            .collect())
    }

    async fn create_instance(
        &self,
        instance: &NewInstance,
        initiation: &NewHistoryEntry,
    ) -> StoreResult<Instance> {
        let mut tables = self.tables.write();

        if self.constrained
            && tables.instances.values().any(|i| {
                i.machine_id == instance.machine_id
                    && i.external_name == instance.external_name
                    && i.external_id == instance.external_id
            })
        {
            return Err(StoreError::UniqueViolation(format!(
                "live instance {}/{} on machine {}",
                instance.external_name, instance.external_id, instance.machine_id
            )));
        }

        tables.next_instance_id += 1;
        let created = Instance {
            id: InstanceId(tables.next_instance_id),
            machine_id: instance.machine_id,
            external_name: instance.external_name.clone(),
            external_id: instance.external_id.clone(),
            state: instance.state.clone(),
            initiated_by: instance.initiated_by.clone(),
            created_at: Utc::now(),
        };
        tables.instances.insert(created.id, created.clone());
        tables.append_history(created.id, initiation);

        Ok(created)
    }

    async fn commit_transition(
        &self,
        instance: InstanceId,
        expected_state: &str,
        entry: &NewHistoryEntry,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();

        let row = tables
            .instances
            .get_mut(&instance)
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance)))?;
        if row.state != expected_state {
            return Err(StoreError::Conflict(format!(
                "instance {} is in '{}', expected '{}'",
                instance, row.state, expected_state
            )));
        }
        row.state = entry.state.clone();
        tables.append_history(instance, entry);

        Ok(())
    }

    async fn delete_instance(&self, instance: InstanceId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        tables
            .instances
            .remove(&instance)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance)))
    }

    async fn history_of(&self, instance: InstanceId) -> StoreResult<Vec<HistoryEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .history
            .iter()
            .filter(|h| h.instance_id == instance)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateKind;

    fn toggle() -> MachineDefinition {
        MachineDefinition {
            name: "toggle".into(),
            description: "on/off".into(),
            states: vec![
                StateDef::new("off", StateKind::Initial),
                StateDef::new("on", StateKind::Stepping),
            ],
            transitions: vec![
                TransitionDef::new("off", "flip", "on"),
                TransitionDef::new("on", "flip", "off"),
            ],
        }
    }

    fn new_instance(machine_id: MachineId) -> NewInstance {
        NewInstance {
            machine_id,
            external_name: "lamp".into(),
            external_id: "1".into(),
            state: "off".into(),
            initiated_by: "dave".into(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_machine_name_rejected() {
        let store = MemoryStore::new();
        store.insert_machine(&toggle()).await.unwrap();
        let err = store.insert_machine(&toggle()).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_create_writes_instance_and_history() {
        let store = MemoryStore::new();
        let machine = store.insert_machine(&toggle()).await.unwrap();

        let instance = store
            .create_instance(
                &new_instance(machine),
                &NewHistoryEntry::initiated("off", "dave"),
            )
            .await
            .unwrap();

        let history = store.history_of(instance.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_initiation());
        assert_eq!(history[0].state, "off");
    }

    #[tokio::test]
    async fn test_unique_key_enforced() {
        let store = MemoryStore::new();
        let machine = store.insert_machine(&toggle()).await.unwrap();
        let initiation = NewHistoryEntry::initiated("off", "dave");

        store
            .create_instance(&new_instance(machine), &initiation)
            .await
            .unwrap();
        let err = store
            .create_instance(&new_instance(machine), &initiation)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(store.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_compare_and_set() {
        let store = MemoryStore::new();
        let machine = store.insert_machine(&toggle()).await.unwrap();
        let instance = store
            .create_instance(
                &new_instance(machine),
                &NewHistoryEntry::initiated("off", "dave"),
            )
            .await
            .unwrap();

        let flip_on = NewHistoryEntry::transition("on", "flip", "dave", "");
        store
            .commit_transition(instance.id, "off", &flip_on)
            .await
            .unwrap();

        // A second writer that still believes the lamp is off loses.
        let err = store
            .commit_transition(instance.id, "off", &flip_on)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.history_of(instance.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let store = MemoryStore::new();
        let machine = store.insert_machine(&toggle()).await.unwrap();
        let instance = store
            .create_instance(
                &new_instance(machine),
                &NewHistoryEntry::initiated("off", "dave"),
            )
            .await
            .unwrap();

        store.delete_instance(instance.id).await.unwrap();

        assert!(store
            .find_instances(machine, "lamp", "1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.history_of(instance.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.delete_instance(instance.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
