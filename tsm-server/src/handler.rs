//! Command handlers.

use crate::error::ServerError;
use crate::session::{Session, SessionState};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tsm_core::{
    HistoryEntry, Instance, InstanceKey, MachineDefinition, StateMachineService, TransitionDef,
    MAX_COMMENT_LEN,
};
use tsm_protocol::message::*;
use tsm_protocol::PROTOCOL_VERSION;

/// Server identity reported by HELLO and INFO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    /// Store backend in use.
    pub store: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "tsm".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: "memory".to_string(),
        }
    }
}

/// Command handler.
///
/// Every request goes straight to the service; nothing read from the store
/// outlives the request that read it.
pub struct CommandHandler {
    service: Arc<StateMachineService>,
    info: ServerInfo,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(service: Arc<StateMachineService>) -> Self {
        Self {
            service,
            info: ServerInfo::default(),
        }
    }

    /// Creates a new command handler with custom server info.
    pub fn with_info(service: Arc<StateMachineService>, info: ServerInfo) -> Self {
        Self { service, info }
    }

    /// Returns the service this handler dispatches to.
    pub fn service(&self) -> &Arc<StateMachineService> {
        &self.service
    }

    /// Handles a request and returns a response.
    pub async fn handle(&self, session: &mut Session, request: &Request) -> Response {
        session.record_request(request.op);

        let result = match request.op {
            Operation::Hello => self.handle_hello(session, &request.params),
            Operation::Ping => Ok(request.params.clone()),
            Operation::Bye => self.handle_bye(session),
            Operation::Info => self.handle_info(),
            Operation::PutMachine => self.handle_put_machine(&request.params).await,
            Operation::GetMachine => self.handle_get_machine(&request.params).await,
            Operation::ListMachines => self.handle_list_machines().await,
            Operation::ListMachineTransitions => {
                self.handle_list_machine_transitions(&request.params).await
            }
            Operation::InitiateInstance => self.handle_initiate_instance(&request.params).await,
            Operation::GetInstance => self.handle_get_instance(&request.params).await,
            Operation::DeleteInstance => self.handle_delete_instance(&request.params).await,
            Operation::ListPossibleTransitions => {
                self.handle_list_possible_transitions(&request.params).await
            }
            Operation::TransitionInstance => {
                self.handle_transition_instance(&request.params).await
            }
            Operation::GetInstanceHistory => self.handle_get_history(&request.params).await,
        };

        match result {
            Ok(value) => Response::ok(&request.id, value),
            Err(e) => {
                session.record_failure();
                if e.error_code() == tsm_protocol::ErrorCode::UnknownError {
                    tracing::error!(op = ?request.op, id = %request.id, "request failed: {}", e);
                } else if e.is_integrity_defect() {
                    tracing::warn!(op = ?request.op, id = %request.id, "store integrity: {}", e);
                }
                let mut error = ResponseError::new(e.error_code(), e.to_string());
                error.retryable = e.is_retryable();
                Response::fail(&request.id, error)
            }
        }
    }

    fn handle_hello(&self, session: &mut Session, params: &Value) -> Result<Value, ServerError> {
        let hello: HelloParams = parse_params(params)?;

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }

        session.complete_handshake(hello.protocol_version, hello.client_name);

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
        };

        Ok(serde_json::to_value(result)?)
    }

    fn handle_bye(&self, session: &mut Session) -> Result<Value, ServerError> {
        session.set_state(SessionState::Closing);
        Ok(json!({"goodbye": true}))
    }

    fn handle_info(&self) -> Result<Value, ServerError> {
        let result = InfoResult {
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            protocol_version: PROTOCOL_VERSION,
            store: self.info.store.clone(),
            max_comment_len: MAX_COMMENT_LEN,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_put_machine(&self, params: &Value) -> Result<Value, ServerError> {
        let p: PutMachineParams = parse_params(params)?;
        let definition = MachineDefinition::from_json(&p.definition)?;
        let machine = definition.name.clone();

        let outcome = self.service.put_machine(definition).await?;

        let result = PutMachineResult {
            machine,
            machine_id: outcome.machine_id.0,
            checksum: outcome.checksum,
            created: outcome.created,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_get_machine(&self, params: &Value) -> Result<Value, ServerError> {
        let p: MachineParams = parse_params(params)?;
        let definition = self.service.get_machine(&p.machine).await?;

        let result = GetMachineResult {
            checksum: definition.checksum(),
            definition: serde_json::to_value(&definition)?,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_list_machines(&self) -> Result<Value, ServerError> {
        let machines: Vec<MachineSummary> = self
            .service
            .list_machines()
            .await?
            .into_iter()
            .map(|record| MachineSummary {
                name: record.name,
                description: record.description,
            })
            .collect();

        Ok(serde_json::to_value(ListMachinesResult { machines })?)
    }

    async fn handle_list_machine_transitions(&self, params: &Value) -> Result<Value, ServerError> {
        let p: MachineParams = parse_params(params)?;
        let transitions = self.service.list_machine_transitions(&p.machine).await?;
        transitions_result(transitions)
    }

    async fn handle_initiate_instance(&self, params: &Value) -> Result<Value, ServerError> {
        let p: InitiateParams = parse_params(params)?;
        let key = instance_key(p.key);
        let instance = self.service.initiate(&key, &p.initiated_by).await?;
        Ok(serde_json::to_value(instance_view(&key, instance))?)
    }

    async fn handle_get_instance(&self, params: &Value) -> Result<Value, ServerError> {
        let p: InstanceKeyParams = parse_params(params)?;
        let key = instance_key(p);
        let instance = self.service.get(&key).await?;
        Ok(serde_json::to_value(instance_view(&key, instance))?)
    }

    async fn handle_delete_instance(&self, params: &Value) -> Result<Value, ServerError> {
        let p: InstanceKeyParams = parse_params(params)?;
        self.service.delete(&instance_key(p)).await?;
        Ok(Value::Null)
    }

    async fn handle_list_possible_transitions(
        &self,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let p: InstanceKeyParams = parse_params(params)?;
        let transitions = self
            .service
            .list_possible_transitions(&instance_key(p))
            .await?;
        transitions_result(transitions)
    }

    async fn handle_transition_instance(&self, params: &Value) -> Result<Value, ServerError> {
        let p: TransitionParams = parse_params(params)?;
        let outcome = self
            .service
            .transition(&instance_key(p.key), &p.transition, &p.made_by, &p.comment)
            .await?;

        let result = TransitionResult {
            from_state: outcome.from_state,
            to_state: outcome.to_state,
            transition: outcome.transition.name,
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_get_history(&self, params: &Value) -> Result<Value, ServerError> {
        let p: InstanceKeyParams = parse_params(params)?;
        let history = self.service.instance_history(&instance_key(p)).await?;

        let result = HistoryResult {
            instance_id: history.instance_id.0,
            entries: history.entries.into_iter().map(history_view).collect(),
        };
        Ok(serde_json::to_value(result)?)
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, ServerError> {
    serde_json::from_value(params.clone()).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

fn instance_key(p: InstanceKeyParams) -> InstanceKey {
    InstanceKey::new(p.external_name, p.external_id, p.machine)
}

fn instance_view(key: &InstanceKey, instance: Instance) -> InstanceView {
    InstanceView {
        id: instance.id.0,
        machine: key.machine.clone(),
        external_name: instance.external_name,
        external_id: instance.external_id,
        state: instance.state,
        initiated_by: instance.initiated_by,
        created_at: instance.created_at,
    }
}

fn transition_view(t: TransitionDef) -> TransitionView {
    TransitionView {
        from_state: t.from,
        transition_name: t.name,
        to_state: t.to,
        pre_task: t.pre_task,
        post_task: t.post_task,
    }
}

fn transitions_result(transitions: Vec<TransitionDef>) -> Result<Value, ServerError> {
    let result = TransitionsResult {
        transitions: transitions.into_iter().map(transition_view).collect(),
    };
    Ok(serde_json::to_value(result)?)
}

fn history_view(entry: HistoryEntry) -> HistoryView {
    HistoryView {
        id: entry.id,
        state: entry.state,
        transition_name: entry.transition,
        made_by: entry.actor,
        comment: entry.comment,
        recorded_at: entry.recorded_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tsm_core::MemoryStore;
    use tsm_protocol::ErrorCode;

    fn test_handler() -> (CommandHandler, Session) {
        let service = Arc::new(StateMachineService::new(Arc::new(MemoryStore::new())));
        let handler = CommandHandler::new(service);
        let session = Session::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));
        (handler, session)
    }

    fn approval_definition() -> Value {
        json!({
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
                {"from": "Init", "name": "Submit", "to": "Submitted", "pre_task": "preSubmit"},
                {"from": "Submitted", "name": "Approve", "to": "Approved"},
                {"from": "Submitted", "name": "Reject", "to": "Rejected"},
                {"from": "Approved", "name": "Close", "to": "Closed"},
                {"from": "Rejected", "name": "Close", "to": "Closed"}
            ]
        })
    }

    fn document(id: &str) -> Value {
        json!({"external_name": "document", "external_id": id, "machine": "approval"})
    }

    async fn provisioned() -> (CommandHandler, Session) {
        let (handler, mut session) = test_handler();
        let request = Request::new("put", Operation::PutMachine)
            .with_params(json!({"definition": approval_definition()}));
        let response = handler.handle(&mut session, &request).await;
        assert!(response.is_ok());
        (handler, session)
    }

    fn error_code(response: &Response) -> ErrorCode {
        response.error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn test_hello() {
        let (handler, mut session) = test_handler();

        let request = Request::new("1", Operation::Hello).with_params(json!({
            "protocol_version": 1,
            "client_name": "test"
        }));

        let response = handler.handle(&mut session, &request).await;
        assert!(response.is_ok());
        assert_eq!(response.payload.unwrap()["server_name"], "tsm");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.client_name(), Some("test"));
    }

    #[tokio::test]
    async fn test_hello_wrong_version() {
        let (handler, mut session) = test_handler();

        let request =
            Request::new("1", Operation::Hello).with_params(json!({"protocol_version": 7}));
        let response = handler.handle(&mut session, &request).await;

        assert!(response.is_fail());
        assert_eq!(error_code(&response), ErrorCode::UnsupportedProtocol);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_ping_echoes_params() {
        let (handler, mut session) = test_handler();

        let request = Request::new("1", Operation::Ping).with_params(json!({"nonce": 17}));
        let response = handler.handle(&mut session, &request).await;

        assert!(response.is_ok());
        assert_eq!(response.payload.unwrap(), json!({"nonce": 17}));
    }

    #[tokio::test]
    async fn test_bye() {
        let (handler, mut session) = test_handler();

        let response = handler
            .handle(&mut session, &Request::new("1", Operation::Bye))
            .await;

        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_info() {
        let (handler, mut session) = test_handler();

        let response = handler
            .handle(&mut session, &Request::new("1", Operation::Info))
            .await;

        let payload = response.payload.unwrap();
        assert_eq!(payload["server_name"], "tsm");
        assert_eq!(payload["store"], "memory");
        assert_eq!(payload["max_comment_len"], 200);
    }

    #[tokio::test]
    async fn test_put_and_get_machine() {
        let (handler, mut session) = provisioned().await;

        let get = Request::new("2", Operation::GetMachine)
            .with_params(json!({"machine": "approval"}));
        let response = handler.handle(&mut session, &get).await;
        assert!(response.is_ok());

        let payload = response.payload.unwrap();
        assert_eq!(payload["definition"]["name"], "approval");
        assert_eq!(payload["definition"]["states"][0]["kind"], "initial");

        // Same content again is accepted without creating anything.
        let put = Request::new("3", Operation::PutMachine)
            .with_params(json!({"definition": approval_definition()}));
        let response = handler.handle(&mut session, &put).await;
        let again = response.payload.unwrap();
        assert_eq!(again["created"], false);
        assert_eq!(again["checksum"], payload["checksum"]);
    }

    #[tokio::test]
    async fn test_put_invalid_machine() {
        let (handler, mut session) = test_handler();

        let request = Request::new("1", Operation::PutMachine).with_params(json!({
            "definition": {
                "name": "broken",
                "states": [{"name": "A", "kind": "stepping"}]
            }
        }));
        let response = handler.handle(&mut session, &request).await;

        assert!(response.is_fail());
        assert_eq!(error_code(&response), ErrorCode::InvalidDefinition);
    }

    #[tokio::test]
    async fn test_list_machines_sorted() {
        let (handler, mut session) = provisioned().await;

        let other = json!({
            "name": "archive",
            "states": [{"name": "Open", "kind": "I"}, {"name": "Done", "kind": "F"}],
            "transitions": [{"from": "Open", "name": "Finish", "to": "Done"}]
        });
        let put = Request::new("1", Operation::PutMachine)
            .with_params(json!({"definition": other}));
        assert!(handler.handle(&mut session, &put).await.is_ok());

        let response = handler
            .handle(&mut session, &Request::new("2", Operation::ListMachines))
            .await;
        let machines = &response.payload.unwrap()["machines"];
        assert_eq!(machines[0]["name"], "approval");
        assert_eq!(machines[0]["description"], "Document approval");
        assert_eq!(machines[1]["name"], "archive");
    }

    #[tokio::test]
    async fn test_list_machine_transitions() {
        let (handler, mut session) = provisioned().await;

        let request = Request::new("1", Operation::ListMachineTransitions)
            .with_params(json!({"machine": "approval"}));
        let response = handler.handle(&mut session, &request).await;

        let transitions = response.payload.unwrap()["transitions"].clone();
        assert_eq!(transitions.as_array().unwrap().len(), 5);
        assert_eq!(transitions[0]["transition_name"], "Submit");
        assert_eq!(transitions[0]["pre_task"], "preSubmit");
    }

    #[tokio::test]
    async fn test_initiate_and_transition() {
        let (handler, mut session) = provisioned().await;

        let mut params = document("42");
        params["initiated_by"] = json!("alice");
        let initiate = Request::new("1", Operation::InitiateInstance).with_params(params);
        let response = handler.handle(&mut session, &initiate).await;
        assert!(response.is_ok());
        let instance = response.payload.unwrap();
        assert_eq!(instance["state"], "Init");
        assert_eq!(instance["machine"], "approval");

        let possible = Request::new("2", Operation::ListPossibleTransitions)
            .with_params(document("42"));
        let response = handler.handle(&mut session, &possible).await;
        let transitions = response.payload.unwrap()["transitions"].clone();
        assert_eq!(transitions.as_array().unwrap().len(), 1);
        assert_eq!(transitions[0]["to_state"], "Submitted");

        let mut params = document("42");
        params["transition"] = json!("Submit");
        params["made_by"] = json!("alice");
        params["comment"] = json!("ready for review");
        let transition = Request::new("3", Operation::TransitionInstance).with_params(params);
        let response = handler.handle(&mut session, &transition).await;
        let result = response.payload.unwrap();
        assert_eq!(result["from_state"], "Init");
        assert_eq!(result["to_state"], "Submitted");

        let get = Request::new("4", Operation::GetInstance).with_params(document("42"));
        let response = handler.handle(&mut session, &get).await;
        assert_eq!(response.payload.unwrap()["state"], "Submitted");
    }

    #[tokio::test]
    async fn test_transition_not_allowed() {
        let (handler, mut session) = provisioned().await;

        let mut params = document("7");
        params["initiated_by"] = json!("bob");
        let initiate = Request::new("1", Operation::InitiateInstance).with_params(params);
        assert!(handler.handle(&mut session, &initiate).await.is_ok());

        let mut params = document("7");
        params["transition"] = json!("Approve");
        params["made_by"] = json!("bob");
        let request = Request::new("2", Operation::TransitionInstance).with_params(params);
        let response = handler.handle(&mut session, &request).await;

        assert!(response.is_fail());
        assert_eq!(error_code(&response), ErrorCode::TransitionNotAllowed);
        assert!(!response.error.unwrap().retryable);
    }

    #[tokio::test]
    async fn test_comment_too_long() {
        let (handler, mut session) = provisioned().await;

        let mut params = document("8");
        params["transition"] = json!("Submit");
        params["made_by"] = json!("bob");
        params["comment"] = json!("x".repeat(201));
        let request = Request::new("1", Operation::TransitionInstance).with_params(params);
        let response = handler.handle(&mut session, &request).await;

        assert_eq!(error_code(&response), ErrorCode::CommentTooLong);
    }

    #[tokio::test]
    async fn test_initiate_twice() {
        let (handler, mut session) = provisioned().await;

        let mut params = document("9");
        params["initiated_by"] = json!("carol");
        let request = Request::new("1", Operation::InitiateInstance).with_params(params);

        assert!(handler.handle(&mut session, &request).await.is_ok());
        let response = handler.handle(&mut session, &request).await;
        assert_eq!(error_code(&response), ErrorCode::ExistingInstanceFound);
    }

    #[tokio::test]
    async fn test_get_instance_not_found() {
        let (handler, mut session) = provisioned().await;

        let request = Request::new("1", Operation::GetInstance).with_params(document("404"));
        let response = handler.handle(&mut session, &request).await;

        assert_eq!(error_code(&response), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let (handler, mut session) = test_handler();

        let request = Request::new("1", Operation::GetInstance).with_params(json!({
            "external_name": "document",
            "external_id": "1",
            "machine": "nope"
        }));
        let response = handler.handle(&mut session, &request).await;

        assert_eq!(error_code(&response), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let (handler, mut session) = provisioned().await;

        let mut params = document("10");
        params["initiated_by"] = json!("dave");
        let initiate = Request::new("1", Operation::InitiateInstance).with_params(params);
        assert!(handler.handle(&mut session, &initiate).await.is_ok());

        let history = Request::new("2", Operation::GetInstanceHistory).with_params(document("10"));
        let response = handler.handle(&mut session, &history).await;
        let payload = response.payload.unwrap();
        assert_eq!(payload["entries"][0]["transition_name"], "instance initiated");
        assert_eq!(payload["entries"][0]["made_by"], "dave");

        let delete = Request::new("3", Operation::DeleteInstance).with_params(document("10"));
        let response = handler.handle(&mut session, &delete).await;
        assert!(response.is_ok());
        assert!(response.payload.is_none());

        let response = handler.handle(&mut session, &history).await;
        assert_eq!(error_code(&response), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_history_names_reinitiated_instance() {
        let (handler, mut session) = provisioned().await;
        let mut params = document("11");
        params["initiated_by"] = json!("erin");
        let initiate = Request::new("1", Operation::InitiateInstance).with_params(params);
        let delete = Request::new("2", Operation::DeleteInstance).with_params(document("11"));
        let history = Request::new("3", Operation::GetInstanceHistory).with_params(document("11"));

        let first = handler.handle(&mut session, &initiate).await.payload.unwrap();
        assert!(handler.handle(&mut session, &delete).await.is_ok());
        let second = handler.handle(&mut session, &initiate).await.payload.unwrap();
        assert_ne!(first["id"], second["id"]);

        let payload = handler.handle(&mut session, &history).await.payload.unwrap();
        assert_eq!(payload["instance_id"], second["id"]);
        assert_eq!(payload["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_params() {
        let (handler, mut session) = provisioned().await;

        let request = Request::new("1", Operation::TransitionInstance)
            .with_params(json!({"machine": "approval"}));
        let response = handler.handle(&mut session, &request).await;

        assert_eq!(error_code(&response), ErrorCode::BadRequest);
        assert_eq!(session.request_count(), 2);
        assert_eq!(session.write_count(), 2);
        assert_eq!(session.failure_count(), 1);
    }
}
