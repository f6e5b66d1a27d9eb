//! Agent client for agents reachable over HTTP.
//!
//! `POST {base}/tasks` with the task as JSON dispatches it; the agent answers
//! with at least a `dispatchId`. `GET {base}/tasks/{id}` returns a
//! `TaskProgress` document.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use cn_core::types::{AgentDomain, DispatchHandle, Task, TaskProgress};

use crate::client::{AgentClient, AgentClientError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchAck {
    dispatch_id: String,
    #[serde(default)]
    estimated_completion_time: Option<DateTime<Utc>>,
}

pub struct HttpAgentClient {
    domain: AgentDomain,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAgentClient {
    pub fn new(domain: AgentDomain, base_url: impl Into<String>) -> Self {
        Self {
            domain,
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Per-request timeout applied by the HTTP client itself. The dispatcher
    /// still enforces its own dispatch timeout on top.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    /// Sent as `Authorization: Bearer <key>`.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

async fn body_text(resp: reqwest::Response) -> String {
    resp.text().await.unwrap_or_default()
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn domain(&self) -> &AgentDomain {
        &self.domain
    }

    async fn dispatch_task(&self, task: &Task) -> Result<DispatchHandle, AgentClientError> {
        let url = format!("{}/tasks", self.base_url);
        debug!(agent = %self.domain, task_id = %task.task_id, %url, "dispatching over http");

        let resp = self.authorize(self.client.post(&url).json(task)).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(AgentClientError::Transport(format!(
                "{status}: {}",
                body_text(resp).await
            )));
        }
        if !status.is_success() {
            return Err(AgentClientError::Rejected(format!(
                "{status}: {}",
                body_text(resp).await
            )));
        }

        let ack: DispatchAck = resp.json().await?;
        Ok(DispatchHandle {
            dispatch_id: ack.dispatch_id,
            task_id: task.task_id.clone(),
            agent: self.domain.clone(),
            estimated_completion_time: ack.estimated_completion_time.unwrap_or_else(|| {
                Utc::now() + chrono::Duration::seconds(i64::from(task.estimated_duration) * 60)
            }),
        })
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskProgress, AgentClientError> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let resp = self.authorize(self.client.get(&url)).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentClientError::UnknownTask(task_id.to_string()));
        }
        if !status.is_success() {
            return Err(AgentClientError::Transport(format!(
                "{status}: {}",
                body_text(resp).await
            )));
        }

        let progress: TaskProgress = resp.json().await?;
        if progress.task_id != task_id {
            return Err(AgentClientError::InvalidResponse(format!(
                "asked for `{task_id}`, agent answered for `{}`",
                progress.task_id
            )));
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slash() {
        let client = HttpAgentClient::new(AgentDomain::backend(), "http://agents.local/backend/");
        assert_eq!(client.base_url(), "http://agents.local/backend");
        assert_eq!(client.domain(), &AgentDomain::backend());
    }

    #[tokio::test]
    async fn unreachable_agent_is_a_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let client = HttpAgentClient::new(AgentDomain::backend(), "http://127.0.0.1:9")
            .with_timeout(Duration::from_secs(2));
        let task = Task::new("t1", AgentDomain::backend(), "create_api");
        let err = client.dispatch_task(&task).await.unwrap_err();
        assert!(matches!(
            err,
            AgentClientError::Transport(_) | AgentClientError::Timeout
        ));
    }

    #[test]
    fn ack_without_estimate_parses() {
        let ack: DispatchAck = serde_json::from_str(r#"{"dispatchId": "d-1"}"#).unwrap();
        assert_eq!(ack.dispatch_id, "d-1");
        assert!(ack.estimated_completion_time.is_none());
    }
}
