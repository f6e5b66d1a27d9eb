//! In-process agent used for dry runs (`--simulate`) and tests.
//!
//! Work takes a fixed wall-clock duration per task. Dispatch rejections and
//! task failures can be scripted per task id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use cn_core::types::{AgentDomain, DispatchHandle, Task, TaskProgress, TaskStatus};

use crate::client::{AgentClient, AgentClientError};

#[derive(Debug, Clone)]
struct SimulatedTask {
    action: String,
    dispatch_id: String,
    optional: bool,
    accepted_at: Instant,
    started_at: DateTime<Utc>,
    work: Duration,
    failure: Option<String>,
}

pub struct SimulatedAgentClient {
    domain: AgentDomain,
    work_duration: Duration,
    dispatch_delay: Duration,
    tasks: DashMap<String, SimulatedTask>,
    rejections: Mutex<HashMap<String, u32>>,
    failures: HashMap<String, String>,
    attempts: DashMap<String, usize>,
    accepted: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedAgentClient {
    pub fn new(domain: AgentDomain) -> Self {
        Self {
            domain,
            work_duration: Duration::ZERO,
            dispatch_delay: Duration::ZERO,
            tasks: DashMap::new(),
            rejections: Mutex::new(HashMap::new()),
            failures: HashMap::new(),
            attempts: DashMap::new(),
            accepted: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// How long each accepted task runs before it reports completion.
    pub fn with_work_duration(mut self, work: Duration) -> Self {
        self.work_duration = work;
        self
    }

    /// How long `dispatch_task` takes to answer.
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    /// Reject the first `times` dispatch attempts for `task_id`.
    pub fn reject_times(self, task_id: impl Into<String>, times: u32) -> Self {
        self.rejections
            .lock()
            .expect("simulated agent lock poisoned")
            .insert(task_id.into(), times);
        self
    }

    /// Reject every dispatch attempt for `task_id`.
    pub fn reject_always(self, task_id: impl Into<String>) -> Self {
        self.reject_times(task_id, u32::MAX)
    }

    /// Accept `task_id` but report it failed once its work is done.
    pub fn fail_task(mut self, task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.insert(task_id.into(), reason.into());
        self
    }

    /// Dispatch attempts seen for `task_id`, accepted or not.
    pub fn dispatch_attempts(&self, task_id: &str) -> usize {
        self.attempts.get(task_id).map(|n| *n).unwrap_or(0)
    }

    /// Accepted task ids in acceptance order.
    pub fn accepted_tasks(&self) -> Vec<String> {
        self.accepted
            .lock()
            .expect("simulated agent lock poisoned")
            .clone()
    }

    /// Highest number of `dispatch_task` calls that were running at once.
    pub fn peak_concurrent_dispatches(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_rejection(&self, task_id: &str) -> bool {
        let mut rejections = self.rejections.lock().expect("simulated agent lock poisoned");
        match rejections.get_mut(task_id) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }

    async fn accept(&self, task: &Task) -> Result<DispatchHandle, AgentClientError> {
        *self.attempts.entry(task.task_id.clone()).or_insert(0) += 1;

        if !self.dispatch_delay.is_zero() {
            tokio::time::sleep(self.dispatch_delay).await;
        }

        if self.take_rejection(&task.task_id) {
            debug!(agent = %self.domain, task_id = %task.task_id, "simulated dispatch rejection");
            return Err(AgentClientError::Rejected(format!(
                "{} is not accepting `{}` right now",
                self.domain, task.task_id
            )));
        }

        let started_at = Utc::now();
        let entry = SimulatedTask {
            action: task.action.clone(),
            dispatch_id: format!("sim-{}", Uuid::new_v4()),
            optional: task.optional,
            accepted_at: Instant::now(),
            started_at,
            work: self.work_duration,
            failure: self.failures.get(&task.task_id).cloned(),
        };
        let handle = DispatchHandle {
            dispatch_id: entry.dispatch_id.clone(),
            task_id: task.task_id.clone(),
            agent: self.domain.clone(),
            estimated_completion_time: estimate(started_at, entry.work),
        };
        self.tasks.insert(task.task_id.clone(), entry);
        self.accepted
            .lock()
            .expect("simulated agent lock poisoned")
            .push(task.task_id.clone());
        Ok(handle)
    }
}

fn estimate(started_at: DateTime<Utc>, work: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(work)
        .map(|d| started_at + d)
        .unwrap_or(started_at)
}

#[async_trait]
impl AgentClient for SimulatedAgentClient {
    fn domain(&self) -> &AgentDomain {
        &self.domain
    }

    async fn dispatch_task(&self, task: &Task) -> Result<DispatchHandle, AgentClientError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.accept(task).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskProgress, AgentClientError> {
        let task = self
            .tasks
            .get(task_id)
            .map(|t| t.clone())
            .ok_or_else(|| AgentClientError::UnknownTask(task_id.to_string()))?;

        let elapsed = task.accepted_at.elapsed();
        let done = elapsed >= task.work;
        let progress = if done {
            100
        } else {
            (elapsed.as_millis() * 100 / task.work.as_millis().max(1)).min(99) as u8
        };

        let (status, result, error) = match (done, task.failure) {
            (false, _) => (TaskStatus::Running, None, None),
            (true, Some(reason)) => (TaskStatus::Failed, None, Some(reason)),
            (true, None) => (
                TaskStatus::Completed,
                Some(serde_json::json!({
                    "agent": self.domain.as_str(),
                    "action": task.action,
                    "simulated": true,
                })),
                None,
            ),
        };

        Ok(TaskProgress {
            task_id: task_id.to_string(),
            agent: self.domain.clone(),
            status,
            progress,
            started_at: Some(task.started_at),
            estimated_completion: Some(estimate(task.started_at, task.work)),
            result,
            error,
            dispatch_id: Some(task.dispatch_id),
            optional: task.optional,
        })
    }
}
