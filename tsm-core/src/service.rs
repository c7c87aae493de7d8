//! Service facade - the public operation set.
//!
//! Every call re-reads what it needs from the store; nothing is cached
//! between calls.

use crate::definition::{MachineDefinition, MachineRecord, TransitionDef};
use crate::engine::TransitionEngine;
use crate::error::CoreError;
use crate::history::{HistoryEntry, HistoryLedger, NewHistoryEntry};
use crate::instance::{Instance, InstanceId, InstanceKey, InstanceStore, MachineId, NewInstance};
use crate::registry::DefinitionRegistry;
use crate::store::{Store, StoreError};
use std::sync::Arc;

/// Result of provisioning a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutMachineOutcome {
    pub machine_id: MachineId,
    pub checksum: String,
    /// False when an identical definition was already registered.
    pub created: bool,
}

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from_state: String,
    pub to_state: String,
    pub transition: TransitionDef,
}

/// The live instance for a key and its history, read together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHistory {
    pub instance_id: InstanceId,
    pub entries: Vec<HistoryEntry>,
}

/// Engine entry point shared by all request handlers.
pub struct StateMachineService {
    store: Arc<dyn Store>,
    engine: TransitionEngine,
}

impl StateMachineService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            engine: TransitionEngine::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Releases the underlying store.
    pub async fn close(&self) {
        self.store.close().await;
    }

    fn registry(&self) -> DefinitionRegistry<'_> {
        DefinitionRegistry::new(self.store.as_ref())
    }

    fn instances(&self) -> InstanceStore<'_> {
        InstanceStore::new(self.store.as_ref())
    }

    fn ledger(&self) -> HistoryLedger<'_> {
        HistoryLedger::new(self.store.as_ref())
    }

    // =========================================================================
    // Machine Definition Management
    // =========================================================================

    /// Validates and registers a machine definition.
    ///
    /// Registering an identical definition again is a no-op.
    pub async fn put_machine(
        &self,
        definition: MachineDefinition,
    ) -> Result<PutMachineOutcome, CoreError> {
        definition.validate()?;
        let checksum = definition.checksum();

        let existing = self.registry().resolve(&definition.name).await;
        match existing {
            Ok(existing) => {
                let stored = self.registry().definition(&existing).await?;
                if stored.checksum() == checksum {
                    return Ok(PutMachineOutcome {
                        machine_id: existing.id,
                        checksum,
                        created: false,
                    });
                }
                return Err(CoreError::MachineExists {
                    machine: definition.name,
                });
            }
            Err(CoreError::MachineNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let machine_id = self
            .store
            .insert_machine(&definition)
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => CoreError::MachineExists {
                    machine: definition.name.clone(),
                },
                other => other.into(),
            })?;

        tracing::info!(
            machine = %definition.name,
            %machine_id,
            states = definition.states.len(),
            transitions = definition.transitions.len(),
            "registered machine"
        );

        Ok(PutMachineOutcome {
            machine_id,
            checksum,
            created: true,
        })
    }

    /// Returns the stored definition of a machine.
    pub async fn get_machine(&self, machine: &str) -> Result<MachineDefinition, CoreError> {
        let registry = self.registry();
        let record = registry.resolve(machine).await?;
        registry.definition(&record).await
    }

    /// Lists registered machines by name.
    pub async fn list_machines(&self) -> Result<Vec<MachineRecord>, CoreError> {
        Ok(self.store.list_machines().await?)
    }

    /// Every transition a machine defines, from any state.
    pub async fn list_machine_transitions(
        &self,
        machine: &str,
    ) -> Result<Vec<TransitionDef>, CoreError> {
        let registry = self.registry();
        let record = registry.resolve(machine).await?;
        registry.all_transitions(&record).await
    }

    // =========================================================================
    // Instance Management
    // =========================================================================

    /// Creates an instance in the machine's initial state.
    pub async fn initiate(
        &self,
        key: &InstanceKey,
        initiated_by: &str,
    ) -> Result<Instance, CoreError> {
        let registry = self.registry();
        let instances = self.instances();
        let machine = registry.resolve(&key.machine).await?;

        match instances.find(&machine, key).await {
            Ok(_) => return Err(CoreError::ExistingInstanceFound { key: key.clone() }),
            Err(CoreError::InstanceNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let initial = registry.initial_state(&machine).await?;
        let new_instance = NewInstance::new(&machine, key, &initial, initiated_by);
        let initiation = NewHistoryEntry::initiated(&initial, initiated_by);
        let instance = instances.create(key, &new_instance, &initiation).await?;

        tracing::info!(
            %key,
            instance_id = %instance.id,
            state = %instance.state,
            initiated_by,
            "initiated instance"
        );

        Ok(instance)
    }

    /// Returns the live instance for a key.
    pub async fn get(&self, key: &InstanceKey) -> Result<Instance, CoreError> {
        let machine = self.registry().resolve(&key.machine).await?;
        self.instances().find(&machine, key).await
    }

    /// Hard-deletes the live instance for a key. History is retained.
    pub async fn delete(&self, key: &InstanceKey) -> Result<(), CoreError> {
        let machine = self.registry().resolve(&key.machine).await?;
        let instances = self.instances();
        let instance = instances.find(&machine, key).await?;
        instances.delete(key, &instance).await?;

        tracing::info!(%key, instance_id = %instance.id, "deleted instance");
        Ok(())
    }

    /// Transitions legal from the instance's current state.
    pub async fn list_possible_transitions(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<TransitionDef>, CoreError> {
        let registry = self.registry();
        let machine = registry.resolve(&key.machine).await?;
        let instance = self.instances().find(&machine, key).await?;
        registry.legal_transitions(&machine, &instance.state).await
    }

    /// Applies a named transition to the live instance for a key.
    ///
    /// The comment is checked before anything is read, and the state change
    /// and its history entry are applied as one unit.
    pub async fn transition(
        &self,
        key: &InstanceKey,
        transition: &str,
        made_by: &str,
        comment: &str,
    ) -> Result<TransitionOutcome, CoreError> {
        self.engine.check_comment(comment)?;

        let registry = self.registry();
        let instances = self.instances();
        let machine = registry.resolve(&key.machine).await?;
        let instance = instances.find(&machine, key).await?;

        let legal = registry.legal_transitions(&machine, &instance.state).await?;
        let plan = self
            .engine
            .plan(&instance.state, legal, transition, made_by, comment)?;
        instances.set_state(key, &instance, &plan.entry).await?;

        tracing::info!(
            %key,
            transition,
            from = %plan.from_state,
            to = %plan.to_state(),
            made_by,
            "applied transition"
        );

        Ok(TransitionOutcome {
            to_state: plan.to_state().to_string(),
            from_state: plan.from_state,
            transition: plan.transition,
        })
    }

    /// History of the live instance for a key, oldest first.
    pub async fn get_history(&self, key: &InstanceKey) -> Result<Vec<HistoryEntry>, CoreError> {
        Ok(self.instance_history(key).await?.entries)
    }

    /// Like [`get_history`](Self::get_history), also naming the instance
    /// the entries were read for.
    pub async fn instance_history(
        &self,
        key: &InstanceKey,
    ) -> Result<InstanceHistory, CoreError> {
        let machine = self.registry().resolve(&key.machine).await?;
        let instance = self.instances().find(&machine, key).await?;
        let entries = self.ledger().list_for(instance.id).await?;
        Ok(InstanceHistory {
            instance_id: instance.id,
            entries,
        })
    }
}
