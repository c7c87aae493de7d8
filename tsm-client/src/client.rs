//! High-level client API.

use crate::connection::{into_payload, Connection, ConnectionConfig};
use crate::error::ClientError;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tsm_protocol::message::*;

/// High-level client for tsm.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server and starts dispatching responses in the
    /// background.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let conn = self.conn.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("read loop ended: {}", e);
            }
        });

        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        let response = self.conn.request(op, params).await?;
        into_payload(response)
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        op: Operation,
        params: Value,
    ) -> Result<T, ClientError> {
        let result = self.request(op, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server. The server echoes `params` back.
    pub async fn ping(&self, params: Value) -> Result<Value, ClientError> {
        self.request(Operation::Ping, params).await
    }

    /// Gets server info.
    pub async fn info(&self) -> Result<InfoResult, ClientError> {
        self.request_as(Operation::Info, json!({})).await
    }

    // =========================================================================
    // Machine operations
    // =========================================================================

    /// Registers a machine definition.
    pub async fn put_machine(&self, definition: Value) -> Result<PutMachineResult, ClientError> {
        let params = serde_json::to_value(PutMachineParams { definition })?;
        self.request_as(Operation::PutMachine, params).await
    }

    /// Gets a machine definition.
    pub async fn get_machine(&self, machine: &str) -> Result<GetMachineResult, ClientError> {
        self.request_as(Operation::GetMachine, json!({"machine": machine}))
            .await
    }

    /// Lists all machines, sorted by name.
    pub async fn list_machines(&self) -> Result<Vec<MachineSummary>, ClientError> {
        let result: ListMachinesResult =
            self.request_as(Operation::ListMachines, json!({})).await?;
        Ok(result.machines)
    }

    /// Every transition a machine defines.
    pub async fn list_machine_transitions(
        &self,
        machine: &str,
    ) -> Result<Vec<TransitionView>, ClientError> {
        let result: TransitionsResult = self
            .request_as(
                Operation::ListMachineTransitions,
                json!({"machine": machine}),
            )
            .await?;
        Ok(result.transitions)
    }

    // =========================================================================
    // Instance operations
    // =========================================================================

    /// Creates an instance in its machine's initial state.
    pub async fn initiate_instance(
        &self,
        key: &InstanceKeyParams,
        initiated_by: &str,
    ) -> Result<InstanceView, ClientError> {
        let params = serde_json::to_value(InitiateParams {
            key: key.clone(),
            initiated_by: initiated_by.to_string(),
        })?;
        self.request_as(Operation::InitiateInstance, params).await
    }

    /// Gets the live instance for a key.
    pub async fn get_instance(&self, key: &InstanceKeyParams) -> Result<InstanceView, ClientError> {
        self.request_as(Operation::GetInstance, serde_json::to_value(key)?)
            .await
    }

    /// Deletes the live instance for a key. Its history is kept.
    pub async fn delete_instance(&self, key: &InstanceKeyParams) -> Result<(), ClientError> {
        self.request(Operation::DeleteInstance, serde_json::to_value(key)?)
            .await?;
        Ok(())
    }

    /// Transitions legal from the instance's current state.
    pub async fn list_possible_transitions(
        &self,
        key: &InstanceKeyParams,
    ) -> Result<Vec<TransitionView>, ClientError> {
        let result: TransitionsResult = self
            .request_as(
                Operation::ListPossibleTransitions,
                serde_json::to_value(key)?,
            )
            .await?;
        Ok(result.transitions)
    }

    /// Applies a named transition. Runs no client-side tasks; see
    /// [`TaskRunner`](crate::tasks::TaskRunner) for that.
    pub async fn transition_instance(
        &self,
        key: &InstanceKeyParams,
        transition: &str,
        made_by: &str,
        comment: &str,
    ) -> Result<TransitionResult, ClientError> {
        let params = serde_json::to_value(TransitionParams {
            key: key.clone(),
            transition: transition.to_string(),
            made_by: made_by.to_string(),
            comment: comment.to_string(),
        })?;
        self.request_as(Operation::TransitionInstance, params).await
    }

    /// History of the live instance for a key, oldest first.
    pub async fn get_instance_history(
        &self,
        key: &InstanceKeyParams,
    ) -> Result<HistoryResult, ClientError> {
        self.request_as(Operation::GetInstanceHistory, serde_json::to_value(key)?)
            .await
    }
}
