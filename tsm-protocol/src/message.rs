//! JSON message types for requests and responses.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Operations understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Session management
    Hello,
    Ping,
    Bye,

    // Server info
    Info,

    // Machine definitions
    PutMachine,
    GetMachine,
    ListMachines,
    ListMachineTransitions,

    // Instances
    InitiateInstance,
    GetInstance,
    DeleteInstance,
    ListPossibleTransitions,
    TransitionInstance,
    GetInstanceHistory,
}

impl Operation {
    /// Operations that change stored state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::PutMachine
                | Operation::InitiateInstance
                | Operation::DeleteInstance
                | Operation::TransitionInstance
        )
    }
}

/// Request message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID for correlation.
    pub id: String,

    pub op: Operation,

    /// Operation-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, op: Operation) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op,
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Outcome tag of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
}

/// Why a request failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    pub retryable: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Response message envelope.
///
/// `{"result": "OK", "payload": ...}` on success,
/// `{"result": "FAIL", "error": {...}}` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID this response correlates to.
    pub id: String,

    #[serde(rename = "result")]
    pub status: ResponseStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            payload: if payload.is_null() { None } else { Some(payload) },
            error: None,
        }
    }

    pub fn fail(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Fail,
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_fail(&self) -> bool {
        self.status == ResponseStatus::Fail
    }
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Result for HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server_name: String,
    pub server_version: String,
}

/// Result for INFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResult {
    pub server_name: String,
    pub server_version: String,
    pub protocol_version: u16,
    /// Store backend in use ("memory", "postgres").
    pub store: String,
    pub max_comment_len: usize,
}

/// Parameters for PUT_MACHINE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutMachineParams {
    /// Machine definition document.
    pub definition: Value,
}

/// Result for PUT_MACHINE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutMachineResult {
    pub machine: String,
    pub machine_id: i64,
    pub checksum: String,
    pub created: bool,
}

/// Parameters naming a machine (GET_MACHINE, LIST_MACHINE_TRANSITIONS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineParams {
    pub machine: String,
}

/// Result for GET_MACHINE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMachineResult {
    pub definition: Value,
    pub checksum: String,
}

/// One entry of LIST_MACHINES.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Result for LIST_MACHINES.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMachinesResult {
    pub machines: Vec<MachineSummary>,
}

/// Identifies one instance: an external entity on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceKeyParams {
    pub external_name: String,
    pub external_id: String,
    pub machine: String,
}

impl InstanceKeyParams {
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

/// Parameters for INITIATE_INSTANCE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateParams {
    #[serde(flatten)]
    pub key: InstanceKeyParams,
    pub initiated_by: String,
}

/// Parameters for TRANSITION_INSTANCE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionParams {
    #[serde(flatten)]
    pub key: InstanceKeyParams,
    pub transition: String,
    pub made_by: String,
    #[serde(default)]
    pub comment: String,
}

/// An instance as returned by GET_INSTANCE and INITIATE_INSTANCE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: i64,
    pub machine: String,
    pub external_name: String,
    pub external_id: String,
    pub state: String,
    pub initiated_by: String,
    pub created_at: DateTime<Utc>,
}

/// A transition descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionView {
    pub from_state: String,
    pub transition_name: String,
    pub to_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_task: Option<String>,
}

/// Result for LIST_POSSIBLE_TRANSITIONS and LIST_MACHINE_TRANSITIONS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionsResult {
    pub transitions: Vec<TransitionView>,
}

/// Result for TRANSITION_INSTANCE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResult {
    pub from_state: String,
    pub to_state: String,
    pub transition: String,
}

/// One audit record of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryView {
    pub id: i64,
    pub state: String,
    pub transition_name: String,
    pub made_by: String,
    pub comment: String,
    pub recorded_at: DateTime<Utc>,
}

/// Result for GET_INSTANCE_HISTORY. Entries are oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResult {
    pub instance_id: i64,
    pub entries: Vec<HistoryView>,
}
