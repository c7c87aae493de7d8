//! Client-side transition tasks.
//!
//! A machine definition may name a pre task and a post task per transition.
//! The server only stores those names; the tasks themselves run here, in
//! the calling process, around the remote transition:
//!
//! 1. the pre task runs first, and its failure aborts the transition;
//! 2. the transition is applied on the server;
//! 3. the post task runs once the server accepted the transition.

use crate::client::Client;
use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tsm_protocol::message::{InstanceKeyParams, TransitionResult, TransitionView};

/// Error type returned by task implementations.
pub type TaskFailure = Box<dyn std::error::Error + Send + Sync>;

/// What a task is told about the transition it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    pub key: InstanceKeyParams,
    pub transition: String,
    pub made_by: String,
    pub comment: String,
}

/// A named piece of client code run before or after a transition.
#[async_trait]
pub trait TransitionTask: Send + Sync {
    async fn run(&self, ctx: &TransitionContext) -> Result<Value, TaskFailure>;
}

#[async_trait]
impl<F, Fut> TransitionTask for F
where
    F: Fn(TransitionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskFailure>> + Send,
{
    async fn run(&self, ctx: &TransitionContext) -> Result<Value, TaskFailure> {
        (self)(ctx.clone()).await
    }
}

/// Errors from [`TaskRunner::transition`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{0}' is not registered")]
    TaskNotRegistered(String),

    #[error("pre task '{task}' failed: {source}")]
    PreTaskFailed {
        task: String,
        #[source]
        source: TaskFailure,
    },

    /// The transition was applied; only the post task failed.
    #[error("post task '{task}' failed after transition to '{}': {source}", .result.to_state)]
    PostTaskFailed {
        task: String,
        result: TransitionResult,
        #[source]
        source: TaskFailure,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Pre and post tasks by name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    pre: HashMap<String, Arc<dyn TransitionTask>>,
    post: HashMap<String, Arc<dyn TransitionTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_task(
        mut self,
        name: impl Into<String>,
        task: impl TransitionTask + 'static,
    ) -> Self {
        self.pre.insert(name.into(), Arc::new(task));
        self
    }

    pub fn with_post_task(
        mut self,
        name: impl Into<String>,
        task: impl TransitionTask + 'static,
    ) -> Self {
        self.post.insert(name.into(), Arc::new(task));
        self
    }

    fn pre_task(&self, name: &str) -> Result<Arc<dyn TransitionTask>, TaskError> {
        self.pre
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotRegistered(name.to_string()))
    }

    fn post_task(&self, name: &str) -> Result<Arc<dyn TransitionTask>, TaskError> {
        self.post
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotRegistered(name.to_string()))
    }
}

/// Outputs of a wrapped transition.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub result: TransitionResult,
    /// Output of the pre task, if one ran.
    pub pre: Option<Value>,
    /// Output of the post task, if one ran.
    pub post: Option<Value>,
}

/// Applies transitions with their client-side tasks.
pub struct TaskRunner {
    client: Client,
    registry: TaskRegistry,
}

impl TaskRunner {
    pub fn new(client: Client, registry: TaskRegistry) -> Self {
        Self { client, registry }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Applies `transition` with its pre and post tasks.
    ///
    /// Task names come from `possible` when given, otherwise from a fresh
    /// `list_possible_transitions` call. A transition not in that list runs
    /// no tasks and is left to the server to reject.
    pub async fn transition(
        &self,
        key: &InstanceKeyParams,
        transition: &str,
        made_by: &str,
        comment: &str,
        possible: Option<&[TransitionView]>,
    ) -> Result<TaskOutcome, TaskError> {
        let fetched;
        let possible = match possible {
            Some(list) => list,
            None => {
                fetched = self.client.list_possible_transitions(key).await?;
                fetched.as_slice()
            }
        };

        let descriptor = possible.iter().find(|t| t.transition_name == transition);
        let pre_task = descriptor
            .and_then(|t| t.pre_task.as_deref())
            .map(|name| self.registry.pre_task(name).map(|task| (name, task)))
            .transpose()?;
        let post_task = descriptor
            .and_then(|t| t.post_task.as_deref())
            .map(|name| self.registry.post_task(name).map(|task| (name, task)))
            .transpose()?;

        let ctx = TransitionContext {
            key: key.clone(),
            transition: transition.to_string(),
            made_by: made_by.to_string(),
            comment: comment.to_string(),
        };

        let pre = match pre_task {
            Some((name, task)) => match task.run(&ctx).await {
                Ok(output) => Some(output),
                Err(source) => {
                    tracing::error!(task = name, transition, "pre task failed: {}", source);
                    return Err(TaskError::PreTaskFailed {
                        task: name.to_string(),
                        source,
                    });
                }
            },
            None => None,
        };

        let result = self
            .client
            .transition_instance(key, transition, made_by, comment)
            .await?;

        let post = match post_task {
            Some((name, task)) => match task.run(&ctx).await {
                Ok(output) => Some(output),
                Err(source) => {
                    tracing::error!(task = name, transition, "post task failed: {}", source);
                    return Err(TaskError::PostTaskFailed {
                        task: name.to_string(),
                        result,
                        source,
                    });
                }
            },
            None => None,
        };

        Ok(TaskOutcome { result, pre, post })
    }
}
