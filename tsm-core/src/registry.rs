//! Definition registry - resolves machines and their transition tables.

use crate::definition::{MachineDefinition, MachineRecord, StateKind, TransitionDef};
use crate::error::CoreError;
use crate::store::Store;

/// Read-only view of provisioned machine definitions.
///
/// Holds nothing between calls; every lookup goes to the store.
pub struct DefinitionRegistry<'a> {
    store: &'a dyn Store,
}

impl<'a> DefinitionRegistry<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Resolves a machine name to its record.
    pub async fn resolve(&self, machine: &str) -> Result<MachineRecord, CoreError> {
        let mut rows = self.store.machines_named(machine).await?;

        match rows.len() {
            0 => Err(CoreError::MachineNotFound {
                machine: machine.to_string(),
            }),
            1 => Ok(rows.remove(0)),
            count => {
                tracing::warn!(machine, count, "machine name is not unique");
                Err(CoreError::AmbiguousDefinition {
                    machine: machine.to_string(),
                    count,
                })
            }
        }
    }

    /// Returns the name of the machine's single initial state.
    pub async fn initial_state(&self, machine: &MachineRecord) -> Result<String, CoreError> {
        let mut initial: Vec<String> = self
            .store
            .states_of(machine.id)
            .await?
            .into_iter()
            .filter(|s| s.kind == StateKind::Initial)
            .map(|s| s.name)
            .collect();

        match initial.len() {
            0 => Err(CoreError::NoInitialState {
                machine: machine.name.clone(),
            }),
            1 => Ok(initial.remove(0)),
            count => {
                tracing::warn!(machine = %machine.name, count, "machine has several initial states");
                Err(CoreError::MultipleInitialStates {
                    machine: machine.name.clone(),
                    count,
                })
            }
        }
    }

    /// Every transition leaving `from_state`. Empty for terminal states.
    pub async fn legal_transitions(
        &self,
        machine: &MachineRecord,
        from_state: &str,
    ) -> Result<Vec<TransitionDef>, CoreError> {
        Ok(self.store.transitions_from(machine.id, from_state).await?)
    }

    /// Every transition of the machine.
    pub async fn all_transitions(
        &self,
        machine: &MachineRecord,
    ) -> Result<Vec<TransitionDef>, CoreError> {
        Ok(self.store.transitions_of(machine.id).await?)
    }

    /// Reassembles the full definition of a machine.
    pub async fn definition(&self, machine: &MachineRecord) -> Result<MachineDefinition, CoreError> {
        let states = self.store.states_of(machine.id).await?;
        let transitions = self.store.transitions_of(machine.id).await?;

        Ok(MachineDefinition {
            name: machine.name.clone(),
            description: machine.description.clone(),
            states,
            transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateDef;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;

    fn door() -> MachineDefinition {
        MachineDefinition {
            name: "door".into(),
            description: String::new(),
            states: vec![
                StateDef::new("open", StateKind::Initial),
                StateDef::new("shut", StateKind::Stepping),
                StateDef::new("gone", StateKind::Final),
            ],
            transitions: vec![
                TransitionDef::new("open", "close", "shut"),
                TransitionDef::new("shut", "open", "open"),
                TransitionDef::new("shut", "remove", "gone"),
            ],
        }
    }

    #[tokio::test]
    async fn test_resolve_and_initial_state() {
        let store = MemoryStore::new();
        let id = store.insert_machine(&door()).await.unwrap();
        let registry = DefinitionRegistry::new(&store);

        let record = registry.resolve("door").await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(registry.initial_state(&record).await.unwrap(), "open");
    }

    #[tokio::test]
    async fn test_resolve_unknown_machine() {
        let store = MemoryStore::new();
        let registry = DefinitionRegistry::new(&store);

        let err = registry.resolve("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resolve_duplicate_names() {
        let store = MemoryStore::unconstrained();
        store.insert_machine(&door()).await.unwrap();
        store.insert_machine(&door()).await.unwrap();
        let registry = DefinitionRegistry::new(&store);

        let err = registry.resolve("door").await.unwrap_err();
        assert!(matches!(err, CoreError::AmbiguousDefinition { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_initial_state_defects() {
        let store = MemoryStore::new();
        let mut none = door();
        none.name = "none".into();
        none.states[0].kind = StateKind::Stepping;
        let mut many = door();
        many.name = "many".into();
        many.states[1].kind = StateKind::Initial;
        store.insert_machine(&none).await.unwrap();
        store.insert_machine(&many).await.unwrap();
        let registry = DefinitionRegistry::new(&store);

        let record = registry.resolve("none").await.unwrap();
        let err = registry.initial_state(&record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoInitialState);

        let record = registry.resolve("many").await.unwrap();
        let err = registry.initial_state(&record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MultipleInitialStates);
    }

    #[tokio::test]
    async fn test_legal_transitions() {
        let store = MemoryStore::new();
        store.insert_machine(&door()).await.unwrap();
        let registry = DefinitionRegistry::new(&store);
        let record = registry.resolve("door").await.unwrap();

        let from_shut = registry.legal_transitions(&record, "shut").await.unwrap();
        let names: Vec<_> = from_shut.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["open", "remove"]);
        assert!(from_shut.iter().all(|t| t.from == "shut"));

        assert!(registry
            .legal_transitions(&record, "gone")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(registry.all_transitions(&record).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_definition_round_trips_through_store() {
        let store = MemoryStore::new();
        store.insert_machine(&door()).await.unwrap();
        let registry = DefinitionRegistry::new(&store);
        let record = registry.resolve("door").await.unwrap();

        let def = registry.definition(&record).await.unwrap();
        assert_eq!(def, door());
        assert_eq!(def.checksum(), door().checksum());
    }
}
