//! Machine definition files.
//!
//! Files ending in `.json` are parsed as JSON, anything else as YAML.

use crate::error::StorageError;
use std::path::Path;
use tsm_core::{MachineDefinition, PutMachineOutcome, StateMachineService};

/// Reads and validates one definition file.
pub fn load_definition(path: impl AsRef<Path>) -> Result<MachineDefinition, StorageError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let parsed = if path.extension().map(|e| e == "json").unwrap_or(false) {
        serde_json::from_str::<serde_json::Value>(&content)
            .map_err(|e| tsm_core::CoreError::InvalidDefinition {
                reason: e.to_string(),
            })
            .and_then(|json| MachineDefinition::from_json(&json))
    } else {
        MachineDefinition::from_yaml_str(&content)
    };

    parsed.map_err(|source| StorageError::Definition {
        path: path.to_path_buf(),
        source,
    })
}

/// Registers every definition file with the service.
///
/// Files whose machine is already registered with identical content are
/// skipped; a machine registered with different content is an error.
pub async fn provision<P: AsRef<Path>>(
    service: &StateMachineService,
    paths: &[P],
) -> Result<Vec<PutMachineOutcome>, StorageError> {
    let mut outcomes = Vec::with_capacity(paths.len());

    for path in paths {
        let path = path.as_ref();
        let definition = load_definition(path)?;
        let name = definition.name.clone();
        let outcome = service.put_machine(definition).await?;

        if outcome.created {
            tracing::info!(machine = %name, path = %path.display(), "provisioned machine");
        } else {
            tracing::debug!(machine = %name, "machine already provisioned");
        }
        outcomes.push(outcome);
    }

    Ok(outcomes)
}
