//! State machine definition types.
//!
//! Machine definitions are provisioned as JSON or YAML documents:
//!
//! ```json
//! {
//!   "name": "approval",
//!   "description": "Document approval",
//!   "states": [
//!     {"name": "Init", "kind": "initial"},
//!     {"name": "Submitted", "kind": "stepping"},
//!     {"name": "Approved", "kind": "stepping"},
//!     {"name": "Closed", "kind": "final"}
//!   ],
//!   "transitions": [
//!     {"from": "Init", "name": "Submit", "to": "Submitted", "pre_task": "preSubmit"},
//!     {"from": "Submitted", "name": "Approve", "to": "Approved"},
//!     {"from": "Approved", "name": "Close", "to": "Closed"}
//!   ]
//! }
//! ```
//!
//! State kinds also accept the single-letter codes `I`, `S` and `F`.

use crate::error::CoreError;
use crate::history::INSTANCE_INITIATED;
use crate::instance::MachineId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Role of a state within its machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Where every new instance starts. Exactly one per machine.
    #[serde(alias = "I")]
    Initial,
    /// Intermediate state.
    #[serde(alias = "S")]
    Stepping,
    /// Terminal state, no outgoing transitions.
    #[serde(alias = "F")]
    Final,
}

impl StateKind {
    /// Single-letter code used by relational backends.
    pub fn code(&self) -> &'static str {
        match self {
            StateKind::Initial => "I",
            StateKind::Stepping => "S",
            StateKind::Final => "F",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(StateKind::Initial),
            "S" => Some(StateKind::Stepping),
            "F" => Some(StateKind::Final),
            _ => None,
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Initial => write!(f, "initial"),
            StateKind::Stepping => write!(f, "stepping"),
            StateKind::Final => write!(f, "final"),
        }
    }
}

/// A state declared by a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    pub kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StateDef {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named, directed edge between two states.
///
/// The optional task names are opaque to the engine; clients use them to
/// look up hooks to run around the remote transition call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub name: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_task: Option<String>,
}

impl TransitionDef {
    pub fn new(from: impl Into<String>, name: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            name: name.into(),
            to: to.into(),
            pre_task: None,
            post_task: None,
        }
    }

    pub fn with_pre_task(mut self, task: impl Into<String>) -> Self {
        self.pre_task = Some(task.into());
        self
    }

    pub fn with_post_task(mut self, task: impl Into<String>) -> Self {
        self.post_task = Some(task.into());
        self
    }
}

/// A machine as registered in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Complete definition of a named state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// States in declaration order.
    pub states: Vec<StateDef>,

    /// Transitions in declaration order.
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
}

impl MachineDefinition {
    /// Parses and validates a definition from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let definition: Self =
            serde_json::from_value(json.clone()).map_err(|e| CoreError::InvalidDefinition {
                reason: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parses and validates a definition from a YAML (or JSON) document.
    pub fn from_yaml_str(input: &str) -> Result<Self, CoreError> {
        let definition: Self =
            serde_yaml::from_str(input).map_err(|e| CoreError::InvalidDefinition {
                reason: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks that the definition is well formed.
    ///
    /// A machine needs a name, uniquely named states with exactly one
    /// initial state, and transitions that connect declared states with
    /// `(from, name)` unique. Final states have no outgoing transitions and
    /// the initiation marker is reserved for history.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(invalid("machine name must not be empty"));
        }

        let mut names = HashSet::new();
        for state in &self.states {
            if state.name.is_empty() {
                return Err(invalid("state name must not be empty"));
            }
            if !names.insert(state.name.as_str()) {
                return Err(invalid(format!("duplicate state '{}'", state.name)));
            }
        }

        let initial = self
            .states
            .iter()
            .filter(|s| s.kind == StateKind::Initial)
            .count();
        match initial {
            0 => return Err(invalid("no initial state declared")),
            1 => {}
            n => return Err(invalid(format!("{} initial states declared", n))),
        }

        let mut edges = HashSet::new();
        for t in &self.transitions {
            if t.name.is_empty() {
                return Err(invalid(format!(
                    "transition from '{}' has an empty name",
                    t.from
                )));
            }
            if t.name == INSTANCE_INITIATED {
                return Err(invalid(format!(
                    "transition name '{}' is reserved",
                    INSTANCE_INITIATED
                )));
            }

            let from = self
                .state(&t.from)
                .ok_or_else(|| invalid(format!("transition source '{}' not in states", t.from)))?;
            if self.state(&t.to).is_none() {
                return Err(invalid(format!(
                    "transition target '{}' not in states",
                    t.to
                )));
            }
            if from.kind == StateKind::Final {
                return Err(invalid(format!(
                    "final state '{}' has outgoing transition '{}'",
                    t.from, t.name
                )));
            }
            if !edges.insert((t.from.as_str(), t.name.as_str())) {
                return Err(invalid(format!(
                    "duplicate transition '{}' from '{}'",
                    t.name, t.from
                )));
            }
        }

        Ok(())
    }

    /// Looks up a declared state by name.
    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Returns the transitions leaving `state`, in declaration order.
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = &'a TransitionDef> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// Content checksum, used to make re-provisioning idempotent.
    pub fn checksum(&self) -> String {
        let mut crc = crc32c::crc32c(self.name.as_bytes());
        crc = append_field(crc, &self.description);
        for state in &self.states {
            crc = append_field(crc, &state.name);
            crc = append_field(crc, state.kind.code());
            crc = append_field(crc, state.description.as_deref().unwrap_or(""));
        }
        for t in &self.transitions {
            crc = append_field(crc, &t.from);
            crc = append_field(crc, &t.name);
            crc = append_field(crc, &t.to);
            crc = append_field(crc, t.pre_task.as_deref().unwrap_or(""));
            crc = append_field(crc, t.post_task.as_deref().unwrap_or(""));
        }
        format!("{:08x}", crc)
    }
}

fn append_field(crc: u32, field: &str) -> u32 {
    let crc = crc32c::crc32c_append(crc, &[0x1f]);
    crc32c::crc32c_append(crc, field.as_bytes())
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> serde_json::Value {
        serde_json::json!({
            "name": "approval",
            "description": "Document approval",
            "states": [
                {"name": "Init", "kind": "initial"},
                {"name": "Submitted", "kind": "stepping"},
                {"name": "Approved", "kind": "stepping"},
                {"name": "Rejected", "kind": "stepping"},
                {"name": "Closed", "kind": "final"}
            ],
            "transitions": [
                {"from": "Init", "name": "Submit", "to": "Submitted", "pre_task": "preSubmit", "post_task": "postSubmit"},
                {"from": "Submitted", "name": "Approve", "to": "Approved"},
                {"from": "Submitted", "name": "Reject", "to": "Rejected"},
                {"from": "Approved", "name": "Modify", "to": "Submitted"},
                {"from": "Rejected", "name": "Modify", "to": "Submitted"},
                {"from": "Approved", "name": "Close", "to": "Closed"},
                {"from": "Rejected", "name": "Close", "to": "Closed"}
            ]
        })
    }

    #[test]
    fn test_parse_definition() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();

        assert_eq!(def.name, "approval");
        assert_eq!(def.states.len(), 5);
        assert_eq!(def.state("Init").unwrap().kind, StateKind::Initial);

        let submit = &def.transitions[0];
        assert_eq!(submit.pre_task.as_deref(), Some("preSubmit"));
        assert_eq!(submit.post_task.as_deref(), Some("postSubmit"));
    }

    #[test]
    fn test_transitions_from_keeps_order() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();

        let names: Vec<_> = def
            .transitions_from("Approved")
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["Modify", "Close"]);
        assert_eq!(def.transitions_from("Closed").count(), 0);
    }

    #[test]
    fn test_state_kind_codes() {
        let yaml = r#"
name: door
states:
  - { name: open, kind: I }
  - { name: shut, kind: S }
  - { name: gone, kind: F }
transitions:
  - { from: open, name: close, to: shut }
  - { from: shut, name: remove, to: gone }
"#;
        let def = MachineDefinition::from_yaml_str(yaml).unwrap();
        assert_eq!(def.states[0].kind, StateKind::Initial);
        assert_eq!(def.states[2].kind, StateKind::Final);
        assert_eq!(StateKind::from_code("S"), Some(StateKind::Stepping));
        assert_eq!(StateKind::from_code("X"), None);
    }

    #[test]
    fn test_missing_initial_state() {
        let json = serde_json::json!({
            "name": "m",
            "states": [{"name": "a", "kind": "stepping"}],
            "transitions": []
        });
        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_multiple_initial_states() {
        let json = serde_json::json!({
            "name": "m",
            "states": [
                {"name": "a", "kind": "initial"},
                {"name": "b", "kind": "initial"}
            ]
        });
        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_unknown_transition_target() {
        let json = serde_json::json!({
            "name": "m",
            "states": [{"name": "a", "kind": "initial"}],
            "transitions": [{"from": "a", "name": "go", "to": "c"}]
        });
        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_duplicate_transition_from_state() {
        let json = serde_json::json!({
            "name": "m",
            "states": [
                {"name": "a", "kind": "initial"},
                {"name": "b", "kind": "stepping"},
                {"name": "c", "kind": "stepping"}
            ],
            "transitions": [
                {"from": "a", "name": "go", "to": "b"},
                {"from": "a", "name": "go", "to": "c"}
            ]
        });
        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_final_state_with_outgoing_transition() {
        let json = serde_json::json!({
            "name": "m",
            "states": [
                {"name": "a", "kind": "initial"},
                {"name": "z", "kind": "final"}
            ],
            "transitions": [
                {"from": "a", "name": "end", "to": "z"},
                {"from": "z", "name": "reopen", "to": "a"}
            ]
        });
        let err = MachineDefinition::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("final state 'z'"));
    }

    #[test]
    fn test_reserved_transition_name() {
        let json = serde_json::json!({
            "name": "m",
            "states": [
                {"name": "a", "kind": "initial"},
                {"name": "b", "kind": "stepping"}
            ],
            "transitions": [{"from": "a", "name": "instance initiated", "to": "b"}]
        });
        let result = MachineDefinition::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let def = MachineDefinition::from_json(&sample_definition()).unwrap();
        let same = MachineDefinition::from_json(&sample_definition()).unwrap();
        assert_eq!(def.checksum(), same.checksum());

        let mut changed = def.clone();
        changed.transitions[1].to = "Rejected".to_string();
        assert_ne!(def.checksum(), changed.checksum());
    }
}
