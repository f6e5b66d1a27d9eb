//! The agent-client boundary: exactly two calls per agent domain.

use async_trait::async_trait;
use thiserror::Error;

use cn_core::types::{AgentDomain, DispatchHandle, Task, TaskProgress};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentClientError {
    /// The agent refused the task. Retried by the dispatcher.
    #[error("agent rejected task: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("agent request timed out")]
    Timeout,

    #[error("task `{0}` is not known to the agent")]
    UnknownTask(String),

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for AgentClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentClientError::Timeout
        } else if err.is_decode() {
            AgentClientError::InvalidResponse(err.to_string())
        } else {
            AgentClientError::Transport(err.to_string())
        }
    }
}

/// One specialised agent (frontend, backend, devops, ...).
///
/// Implementations must be cheap to share; the registry hands out
/// `Arc<dyn AgentClient>` to every plan in flight.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn domain(&self) -> &AgentDomain;

    /// Hand a task to the agent. Returns once the agent has accepted it, not
    /// once the work is done.
    async fn dispatch_task(&self, task: &Task) -> Result<DispatchHandle, AgentClientError>;

    async fn get_task_status(&self, task_id: &str) -> Result<TaskProgress, AgentClientError>;
}
