//! Execution monitor: the live [`ExecutionStatus`] of every plan in flight.
//!
//! Statuses live in a `DashMap` keyed by plan id so concurrent plans never
//! contend on one lock. Every change is published on a flume-backed update
//! bus. A task that reached a terminal state is never changed again, so a
//! failure can not be masked by a later poll.
//!
//! A plan stays claimed by its scheduler run from [`ExecutionMonitor::begin`]
//! until [`ExecutionMonitor::finish_run`], even if its roll-up is already
//! terminal. While claimed it can be neither archived nor started again.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use cn_core::types::{
    AgentDomain, DispatchHandle, ExecutionPlan, ExecutionStatus, GateResult, OverallStatus,
    TaskProgress, TaskStatus,
};

use crate::registry::AgentClientRegistry;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MonitorError {
    #[error("no execution tracked for plan `{0}`")]
    UnknownPlan(String),

    #[error("plan `{0}` is already executing")]
    AlreadyTracked(String),

    #[error("plan `{plan_id}` has no task `{task_id}`")]
    UnknownTask { plan_id: String, task_id: String },

    #[error("plan `{0}` has not reached a terminal status")]
    NotTerminal(String),

    #[error("plan `{0}` is still being executed")]
    StillRunning(String),
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Started,
    TaskDispatched,
    TaskFailed,
    TaskProgress,
    GateEvaluated,
    Warning,
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub plan_id: String,
    pub execution_id: String,
    pub kind: UpdateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub overall_status: OverallStatus,
    pub at: DateTime<Utc>,
}

/// Broadcast bus for [`StatusUpdate`]s. Dropped receivers are pruned on the
/// next publish.
#[derive(Clone, Default)]
pub struct UpdateBus {
    inner: Arc<Mutex<Vec<flume::Sender<StatusUpdate>>>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<StatusUpdate> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().expect("UpdateBus lock poisoned").push(tx);
        rx
    }

    pub fn publish(&self, update: StatusUpdate) {
        let mut senders = self.inner.lock().expect("UpdateBus lock poisoned");
        senders.retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("UpdateBus lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// ExecutionMonitor
// ---------------------------------------------------------------------------

pub struct ExecutionMonitor {
    statuses: DashMap<String, ExecutionStatus>,
    /// Plan ids currently owned by a scheduler run.
    active: DashSet<String>,
    registry: Arc<AgentClientRegistry>,
    bus: UpdateBus,
}

impl ExecutionMonitor {
    pub fn new(registry: Arc<AgentClientRegistry>) -> Self {
        Self {
            statuses: DashMap::new(),
            active: DashSet::new(),
            registry,
            bus: UpdateBus::new(),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<StatusUpdate> {
        self.bus.subscribe()
    }

    /// Start tracking `plan` with every task pending and claim it for the
    /// calling run. A plan id that is still running or still claimed can not
    /// be started twice; a finished one is replaced.
    pub fn begin(&self, plan: &ExecutionPlan) -> Result<ExecutionStatus, MonitorError> {
        let status = ExecutionStatus::for_plan(plan);
        match self.statuses.entry(plan.plan_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().overall_status.is_terminal()
                    || self.active.contains(&plan.plan_id)
                {
                    return Err(MonitorError::AlreadyTracked(plan.plan_id.clone()));
                }
                existing.insert(status.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(status.clone());
            }
        }
        self.active.insert(plan.plan_id.clone());
        info!(plan_id = %plan.plan_id, execution_id = %status.execution_id, tasks = status.total_tasks,
            "tracking execution");
        self.publish(&status, UpdateKind::Started, None);
        Ok(status)
    }

    /// Release the claim taken by [`begin`](Self::begin). The status stays
    /// tracked until archived.
    pub fn finish_run(&self, plan_id: &str) {
        if self.active.remove(plan_id).is_some() {
            debug!(plan_id, "execution run released");
        }
    }

    /// Whether a scheduler run still owns `plan_id`.
    pub fn is_running(&self, plan_id: &str) -> bool {
        self.active.contains(plan_id)
    }

    /// Point-in-time copy of a plan's status.
    pub fn status(&self, plan_id: &str) -> Option<ExecutionStatus> {
        self.statuses.get(plan_id).map(|s| s.clone())
    }

    pub fn plan_ids(&self) -> Vec<String> {
        self.statuses.iter().map(|e| e.key().clone()).collect()
    }

    pub fn record_dispatch(
        &self,
        plan_id: &str,
        handle: &DispatchHandle,
    ) -> Result<ExecutionStatus, MonitorError> {
        self.update(plan_id, UpdateKind::TaskDispatched, Some(&handle.task_id), |status| {
            let task = task_entry(status, &handle.task_id)?;
            if !task.status.is_terminal() {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                task.estimated_completion = Some(handle.estimated_completion_time);
                task.dispatch_id = Some(handle.dispatch_id.clone());
            }
            Ok(())
        })
    }

    pub fn record_dispatch_failure(
        &self,
        plan_id: &str,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<ExecutionStatus, MonitorError> {
        let error = error.into();
        self.update(plan_id, UpdateKind::TaskFailed, Some(task_id), |status| {
            let task = task_entry(status, task_id)?;
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            Ok(())
        })
    }

    /// Merge a progress report from an agent. Reports for tasks that are
    /// already terminal are ignored and progress never moves backwards.
    pub fn apply_progress(
        &self,
        plan_id: &str,
        report: TaskProgress,
    ) -> Result<ExecutionStatus, MonitorError> {
        let task_id = report.task_id.clone();
        self.update(plan_id, UpdateKind::TaskProgress, Some(&task_id), |status| {
            let task = task_entry(status, &task_id)?;
            merge_progress(task, report);
            Ok(())
        })
    }

    pub fn record_gate(
        &self,
        plan_id: &str,
        result: GateResult,
    ) -> Result<ExecutionStatus, MonitorError> {
        self.update(plan_id, UpdateKind::GateEvaluated, None, |status| {
            if !result.passed && !result.required {
                status.warnings.push(format!(
                    "optional quality gate `{}` failed: {}",
                    result.gate_id, result.message
                ));
            }
            status.gate_results.push(result);
            Ok(())
        })
    }

    pub fn add_warning(
        &self,
        plan_id: &str,
        warning: impl Into<String>,
    ) -> Result<ExecutionStatus, MonitorError> {
        let warning = warning.into();
        self.update(plan_id, UpdateKind::Warning, None, |status| {
            status.warnings.push(warning);
            Ok(())
        })
    }

    /// Mark the run failed; the scheduler dispatches nothing further.
    pub fn abort(
        &self,
        plan_id: &str,
        reason: impl Into<String>,
    ) -> Result<ExecutionStatus, MonitorError> {
        let reason = reason.into();
        warn!(plan_id, reason = %reason, "execution aborted");
        self.update(plan_id, UpdateKind::Aborted, None, |status| {
            status.abort_reason = Some(reason);
            Ok(())
        })
    }

    /// Mark the run cancelled. Cancellation is sticky.
    pub fn cancel(
        &self,
        plan_id: &str,
        reason: impl Into<String>,
    ) -> Result<ExecutionStatus, MonitorError> {
        let reason = reason.into();
        self.update(plan_id, UpdateKind::Cancelled, None, |status| {
            status.overall_status = OverallStatus::Cancelled;
            status.warnings.push(format!("cancelled: {reason}"));
            Ok(())
        })
    }

    /// Ask the owning agent of every dispatched, non-terminal task for its
    /// progress. Client errors become warnings on the status.
    pub async fn poll(&self, plan_id: &str) -> Result<ExecutionStatus, MonitorError> {
        let outstanding: Vec<(String, AgentDomain)> = {
            let status = self
                .statuses
                .get(plan_id)
                .ok_or_else(|| MonitorError::UnknownPlan(plan_id.to_string()))?;
            status
                .tasks
                .iter()
                .filter(|t| t.dispatch_id.is_some() && !t.status.is_terminal())
                .map(|t| (t.task_id.clone(), t.agent.clone()))
                .collect()
        };

        let reports = join_all(outstanding.into_iter().map(|(task_id, agent)| async move {
            let result = match self.registry.get(&agent) {
                Some(client) => client.get_task_status(&task_id).await.map_err(|e| e.to_string()),
                None => Err(format!("no agent client for domain `{agent}`")),
            };
            (task_id, result)
        }))
        .await;

        for (task_id, result) in reports {
            match result {
                Ok(report) => {
                    self.apply_progress(plan_id, report)?;
                }
                Err(err) => {
                    debug!(plan_id, task_id = %task_id, error = %err, "status poll failed");
                    self.add_warning(plan_id, format!("status poll for `{task_id}` failed: {err}"))?;
                }
            }
        }

        self.status(plan_id)
            .ok_or_else(|| MonitorError::UnknownPlan(plan_id.to_string()))
    }

    /// Stop tracking a finished plan and hand back its final status. Refused
    /// while a scheduler run still owns the plan.
    pub fn archive(&self, plan_id: &str) -> Result<ExecutionStatus, MonitorError> {
        let removed = self.statuses.remove_if(plan_id, |_, status| {
            status.overall_status.is_terminal() && !self.active.contains(plan_id)
        });
        if let Some((_, status)) = removed {
            return Ok(status);
        }
        match self.statuses.get(plan_id) {
            None => Err(MonitorError::UnknownPlan(plan_id.to_string())),
            Some(_) if self.active.contains(plan_id) => {
                Err(MonitorError::StillRunning(plan_id.to_string()))
            }
            Some(_) => Err(MonitorError::NotTerminal(plan_id.to_string())),
        }
    }

    fn update<F>(
        &self,
        plan_id: &str,
        kind: UpdateKind,
        task_id: Option<&str>,
        f: F,
    ) -> Result<ExecutionStatus, MonitorError>
    where
        F: FnOnce(&mut ExecutionStatus) -> Result<(), MonitorError>,
    {
        let snapshot = {
            let mut entry = self
                .statuses
                .get_mut(plan_id)
                .ok_or_else(|| MonitorError::UnknownPlan(plan_id.to_string()))?;
            let status = entry.value_mut();
            let before = status.overall_status;
            f(status)?;
            status.recompute();
            if status.overall_status != before && status.overall_status.is_terminal() {
                info!(plan_id, overall = %status.overall_status,
                    completed = status.completed_tasks, failed = status.failed_tasks,
                    "execution reached terminal status");
            }
            status.clone()
        };
        self.publish(&snapshot, kind, task_id);
        Ok(snapshot)
    }

    fn publish(&self, status: &ExecutionStatus, kind: UpdateKind, task_id: Option<&str>) {
        self.bus.publish(StatusUpdate {
            plan_id: status.plan_id.clone(),
            execution_id: status.execution_id.clone(),
            kind,
            task_id: task_id.map(str::to_string),
            overall_status: status.overall_status,
            at: status.updated_at,
        });
    }
}

fn task_entry<'a>(
    status: &'a mut ExecutionStatus,
    task_id: &str,
) -> Result<&'a mut TaskProgress, MonitorError> {
    let plan_id = status.plan_id.clone();
    status.task_mut(task_id).ok_or_else(|| MonitorError::UnknownTask {
        plan_id,
        task_id: task_id.to_string(),
    })
}

fn merge_progress(task: &mut TaskProgress, report: TaskProgress) {
    if task.status.is_terminal() {
        return;
    }
    task.status = report.status;
    task.progress = if report.status.is_terminal() {
        100
    } else {
        task.progress.max(report.progress.min(100))
    };
    if report.started_at.is_some() {
        task.started_at = report.started_at;
    }
    if report.estimated_completion.is_some() {
        task.estimated_completion = report.estimated_completion;
    }
    if report.result.is_some() {
        task.result = report.result;
    }
    if report.error.is_some() {
        task.error = report.error;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
