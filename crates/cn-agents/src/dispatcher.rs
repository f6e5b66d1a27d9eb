//! Task dispatcher: routes tasks to agent clients by domain.
//!
//! A missing client is fatal for the task and never retried. Client errors
//! and dispatch timeouts are retried with exponential backoff up to
//! `max_retries` extra attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use cn_core::config::DispatchConfig;
use cn_core::types::{AgentDomain, DispatchHandle, Task};
use cn_telemetry::metrics::{
    global_metrics, MetricsCollector, DISPATCH_DURATION_SECONDS, DISPATCH_TOTAL,
};

use crate::client::AgentClientError;
use crate::registry::AgentClientRegistry;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("no agent client for domain `{agent}` (task `{task_id}`)")]
    UnknownAgent { task_id: String, agent: AgentDomain },

    #[error("agent `{agent}` did not accept task `{task_id}` after {attempts} attempt(s): {reason}")]
    DispatchRejected {
        task_id: String,
        agent: AgentDomain,
        attempts: u32,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on a single `dispatch_task` call.
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
            initial_backoff: cfg.backoff(),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

// ---------------------------------------------------------------------------
// TaskDispatcher
// ---------------------------------------------------------------------------

/// Outcome of one task in a parallel dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PerTaskResult {
    pub task_id: String,
    pub result: Result<DispatchHandle, DispatchError>,
}

pub struct TaskDispatcher {
    registry: Arc<AgentClientRegistry>,
    policy: RetryPolicy,
    metrics: &'static MetricsCollector,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<AgentClientRegistry>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            policy,
            metrics: global_metrics(),
        }
    }

    pub fn from_config(registry: Arc<AgentClientRegistry>, cfg: &DispatchConfig) -> Self {
        Self::new(registry, RetryPolicy::from(cfg))
    }

    pub fn with_metrics(mut self, metrics: &'static MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<AgentClientRegistry> {
        &self.registry
    }

    /// Dispatch one task, retrying client errors and timeouts.
    pub async fn dispatch(&self, task: &Task) -> Result<DispatchHandle, DispatchError> {
        let agent = task.agent.as_str();
        let Some(client) = self.registry.get(&task.agent) else {
            warn!(task_id = %task.task_id, agent, "no client registered for agent domain");
            self.metrics
                .increment_counter(DISPATCH_TOTAL, &[("agent", agent), ("outcome", "unknown_agent")]);
            return Err(DispatchError::UnknownAgent {
                task_id: task.task_id.clone(),
                agent: task.agent.clone(),
            });
        };

        let started = Instant::now();
        let mut last_error = AgentClientError::Timeout;
        for attempt in 0..=self.policy.max_retries {
            let outcome = match tokio::time::timeout(self.policy.timeout, client.dispatch_task(task))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AgentClientError::Timeout),
            };

            match outcome {
                Ok(handle) => {
                    if attempt > 0 {
                        debug!(task_id = %task.task_id, attempt = attempt + 1, "dispatch succeeded after retry");
                    }
                    self.metrics.observe_since(DISPATCH_DURATION_SECONDS, started);
                    self.metrics
                        .increment_counter(DISPATCH_TOTAL, &[("agent", agent), ("outcome", "accepted")]);
                    return Ok(handle);
                }
                Err(err) => {
                    if attempt < self.policy.max_retries {
                        let backoff = self.policy.backoff_for(attempt);
                        warn!(
                            task_id = %task.task_id,
                            agent,
                            attempt = attempt + 1,
                            error = %err,
                            ?backoff,
                            "dispatch attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = err;
                }
            }
        }

        self.metrics.observe_since(DISPATCH_DURATION_SECONDS, started);
        self.metrics
            .increment_counter(DISPATCH_TOTAL, &[("agent", agent), ("outcome", "rejected")]);
        Err(DispatchError::DispatchRejected {
            task_id: task.task_id.clone(),
            agent: task.agent.clone(),
            attempts: self.policy.max_retries + 1,
            reason: last_error.to_string(),
        })
    }

    /// Dispatch every task concurrently and wait for all of them to settle.
    /// Results come back in input order.
    pub async fn dispatch_parallel(&self, tasks: &[Task]) -> Vec<PerTaskResult> {
        join_all(tasks.iter().map(|task| self.dispatch_settled(task))).await
    }

    /// Like [`dispatch_parallel`](Self::dispatch_parallel) with at most
    /// `max_concurrency` dispatches outstanding at once. Zero is treated as one.
    pub async fn dispatch_parallel_bounded(
        &self,
        tasks: &[Task],
        max_concurrency: usize,
    ) -> Vec<PerTaskResult> {
        let limit = if max_concurrency == 0 {
            warn!("max_concurrency of 0 requested, using 1");
            1
        } else {
            max_concurrency
        };
        let semaphore = &Semaphore::new(limit);
        join_all(tasks.iter().map(|task| async move {
            let _permit = semaphore.acquire().await;
            self.dispatch_settled(task).await
        }))
        .await
    }

    async fn dispatch_settled(&self, task: &Task) -> PerTaskResult {
        PerTaskResult {
            task_id: task.task_id.clone(),
            result: self.dispatch(task).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedAgentClient;

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn test_metrics() -> &'static MetricsCollector {
        Box::leak(Box::new(MetricsCollector::new()))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
    }

    #[test]
    fn policy_follows_config() {
        let policy = RetryPolicy::from(&DispatchConfig::default());
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.timeout, Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn unknown_agent_is_not_retried() {
        let metrics = test_metrics();
        let dispatcher = TaskDispatcher::new(
            Arc::new(AgentClientRegistry::simulated_defaults()),
            quick_policy(3),
        )
        .with_metrics(metrics);
        let task = Task::new("t1", AgentDomain::new("ml"), "train_model");
        let err = dispatcher.dispatch(&task).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::UnknownAgent {
                task_id: "t1".into(),
                agent: AgentDomain::new("ml")
            }
        );
        assert_eq!(
            metrics.get_counter(DISPATCH_TOTAL, &[("agent", "ml"), ("outcome", "unknown_agent")]),
            1
        );
    }

    #[tokio::test]
    async fn rejection_is_retried_once_then_accepted() {
        let client = Arc::new(SimulatedAgentClient::new(AgentDomain::backend()).reject_times("t1", 1));
        let registry = AgentClientRegistry::new().with_client(client.clone());
        let dispatcher =
            TaskDispatcher::new(Arc::new(registry), quick_policy(1)).with_metrics(test_metrics());
        let task = Task::new("t1", AgentDomain::backend(), "create_api");
        let handle = dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(handle.task_id, "t1");
        assert_eq!(client.dispatch_attempts("t1"), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let client = Arc::new(SimulatedAgentClient::new(AgentDomain::backend()).reject_always("t1"));
        let registry = AgentClientRegistry::new().with_client(client.clone());
        let metrics = test_metrics();
        let dispatcher =
            TaskDispatcher::new(Arc::new(registry), quick_policy(2)).with_metrics(metrics);
        let task = Task::new("t1", AgentDomain::backend(), "create_api");
        match dispatcher.dispatch(&task).await.unwrap_err() {
            DispatchError::DispatchRejected { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("rejected"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.dispatch_attempts("t1"), 3);
        assert_eq!(
            metrics.get_counter(DISPATCH_TOTAL, &[("agent", "backend"), ("outcome", "rejected")]),
            1
        );
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let client = Arc::new(
            SimulatedAgentClient::new(AgentDomain::devops())
                .with_dispatch_delay(Duration::from_secs(5)),
        );
        let registry = AgentClientRegistry::new().with_client(client);
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            ..quick_policy(0)
        };
        let dispatcher = TaskDispatcher::new(Arc::new(registry), policy).with_metrics(test_metrics());
        let task = Task::new("t1", AgentDomain::devops(), "deploy");
        let err = dispatcher.dispatch(&task).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DispatchRejected { attempts: 1, ref reason, .. } if reason.contains("timed out")
        ));
    }
}
