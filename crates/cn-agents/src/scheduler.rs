//! Execution scheduler: walks a validated plan stage by stage.
//!
//! Stages run in topological order. Within a stage every task is dispatched
//! concurrently and the next stage starts only after all of those dispatches
//! settled (or, in completion-barrier mode, after every task finished).
//! Quality gates are evaluated before the first stage, before every stage
//! that contains a deploy action and after completion.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use cn_core::config::{BarrierMode, SchedulerConfig};
use cn_core::types::{
    ExecutionPlan, ExecutionStage, ExecutionStatus, GateTrigger, OverallStatus, Task,
};
use cn_telemetry::metrics::{
    global_metrics, MetricsCollector, PLANS_EXECUTED_TOTAL, PLANS_IN_FLIGHT,
};
use cn_telemetry::spans::{plan_span, stage_span};

use crate::cancel::CancellationToken;
use crate::dispatcher::TaskDispatcher;
use crate::gates::{GateOutcome, QualityGateEvaluator};
use crate::monitor::{ExecutionMonitor, MonitorError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("stage dependency cycle among: {}", .stages.join(", "))]
    CyclicStageDependency { stages: Vec<String> },

    #[error("stage id `{0}` is declared more than once")]
    DuplicateStage(String),

    #[error("stage `{stage_id}` depends on unknown stage `{dependency}`")]
    UnknownStage { stage_id: String, dependency: String },

    #[error("stage `{stage_id}` lists unknown task `{task_id}`")]
    UnknownTask { stage_id: String, task_id: String },

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub barrier: BarrierMode,
    pub enforce_concurrency: bool,
    pub poll_interval: Duration,
    pub completion_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            barrier: cfg.barrier,
            enforce_concurrency: cfg.enforce_concurrency,
            poll_interval: cfg.poll_interval(),
            completion_timeout: cfg.completion_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage ordering
// ---------------------------------------------------------------------------

/// Stages in dependency order (Kahn's algorithm, ties broken by declared
/// order). Fails before anything is dispatched.
pub fn stage_order(plan: &ExecutionPlan) -> Result<Vec<&ExecutionStage>, ExecutionError> {
    let stages = &plan.execution_stages;
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if index.insert(stage.stage_id.as_str(), i).is_some() {
            return Err(ExecutionError::DuplicateStage(stage.stage_id.clone()));
        }
    }

    let mut indegree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        if let Some(task_id) = stage.parallel_tasks.iter().find(|t| plan.task(t).is_none()) {
            return Err(ExecutionError::UnknownTask {
                stage_id: stage.stage_id.clone(),
                task_id: task_id.clone(),
            });
        }
        for dep in &stage.dependencies {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(ExecutionError::UnknownStage {
                    stage_id: stage.stage_id.clone(),
                    dependency: dep.clone(),
                });
            };
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(next) = ready.pop_first() {
        order.push(&stages[next]);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < stages.len() {
        return Err(ExecutionError::CyclicStageDependency {
            stages: stages
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.stage_id.clone())
                .collect(),
        });
    }
    Ok(order)
}

fn stage_has_deploy(plan: &ExecutionPlan, stage: &ExecutionStage) -> bool {
    stage
        .parallel_tasks
        .iter()
        .filter_map(|id| plan.task(id))
        .any(Task::is_deploy_action)
}

fn all_terminal<'a>(status: &ExecutionStatus, task_ids: impl IntoIterator<Item = &'a String>) -> bool {
    task_ids
        .into_iter()
        .all(|id| status.task(id).map_or(true, |t| t.status.is_terminal()))
}

// ---------------------------------------------------------------------------
// ExecutionScheduler
// ---------------------------------------------------------------------------

pub struct ExecutionScheduler {
    dispatcher: Arc<TaskDispatcher>,
    monitor: Arc<ExecutionMonitor>,
    gates: Arc<dyn QualityGateEvaluator>,
    settings: SchedulerSettings,
    metrics: &'static MetricsCollector,
}

impl ExecutionScheduler {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        monitor: Arc<ExecutionMonitor>,
        gates: Arc<dyn QualityGateEvaluator>,
    ) -> Self {
        Self {
            dispatcher,
            monitor,
            gates,
            settings: SchedulerSettings::default(),
            metrics: global_metrics(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: &'static MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<ExecutionStatus, ExecutionError> {
        self.execute_with_cancel(plan, &CancellationToken::new()).await
    }

    /// Dispatch every stage of `plan`. Returns once the last stage's barrier
    /// is met, or earlier when a required gate fails or `cancel` fires; the
    /// returned status reflects where the run stopped.
    pub async fn execute_with_cancel(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, ExecutionError> {
        self.run_claimed(plan, cancel, false).await
    }

    /// Poll the monitor until every task is terminal, the run was aborted or
    /// cancelled, or `completion_timeout` elapsed; then evaluate the
    /// `after_completion` gates.
    pub async fn await_completion(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<ExecutionStatus, ExecutionError> {
        self.await_completion_with_cancel(plan, &CancellationToken::new())
            .await
    }

    pub async fn await_completion_with_cancel(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, ExecutionError> {
        let deadline = Instant::now() + self.settings.completion_timeout;
        let status = loop {
            let status = self.monitor.poll(&plan.plan_id).await?;
            if status.overall_status == OverallStatus::Cancelled
                || status.abort_reason.is_some()
                || all_terminal(&status, plan.tasks.iter().map(|t| &t.task_id))
            {
                break status;
            }
            if cancel.is_cancelled() {
                break self.monitor.cancel(&plan.plan_id, "cancelled while awaiting completion")?;
            }
            if Instant::now() >= deadline {
                warn!(plan_id = %plan.plan_id, timeout = ?self.settings.completion_timeout,
                    "plan did not finish in time");
                break self.monitor.add_warning(
                    &plan.plan_id,
                    format!(
                        "tasks still running after {:?}; after_completion gates skipped",
                        self.settings.completion_timeout
                    ),
                )?;
            }
            self.pause(cancel).await;
        };

        if status.abort_reason.is_some()
            || status.overall_status == OverallStatus::Cancelled
            || !all_terminal(&status, plan.tasks.iter().map(|t| &t.task_id))
        {
            return Ok(status);
        }
        self.run_gates(plan, GateTrigger::AfterCompletion).await?;
        Ok(self.current(plan)?)
    }

    pub async fn run_to_completion(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<ExecutionStatus, ExecutionError> {
        self.run_to_completion_with_cancel(plan, &CancellationToken::new())
            .await
    }

    pub async fn run_to_completion_with_cancel(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, ExecutionError> {
        self.run_claimed(plan, cancel, true).await
    }

    /// The plan stays claimed in the monitor for the whole run, so it can not
    /// be archived or restarted underneath us. The claim is released on
    /// every exit path after `begin` succeeded.
    async fn run_claimed(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
        wait_for_completion: bool,
    ) -> Result<ExecutionStatus, ExecutionError> {
        let order = stage_order(plan)?;
        let (span, trace_id) = plan_span(&plan.plan_id, &plan.command_id);

        async {
            if let Err(err) = self.monitor.begin(plan) {
                return Err(ExecutionError::from(err));
            }
            info!(plan_id = %plan.plan_id, stages = order.len(), tasks = plan.tasks.len(),
                barrier = ?self.settings.barrier, "executing plan");
            self.metrics.add_gauge(PLANS_IN_FLIGHT, 1);

            let mut outcome = self.dispatch_phase(plan, &order, cancel, &trace_id).await;
            if wait_for_completion && outcome.is_ok() {
                outcome = self.await_completion_with_cancel(plan, cancel).await;
            }

            self.metrics.add_gauge(PLANS_IN_FLIGHT, -1);
            self.monitor.finish_run(&plan.plan_id);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn dispatch_phase(
        &self,
        plan: &ExecutionPlan,
        order: &[&ExecutionStage],
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<ExecutionStatus, ExecutionError> {
        self.run_stages(plan, order, cancel, trace_id).await?;

        let status = self.current(plan)?;
        let label = status.overall_status.to_string();
        self.metrics
            .increment_counter(PLANS_EXECUTED_TOTAL, &[("outcome", label.as_str())]);
        info!(plan_id = %plan.plan_id, overall = %status.overall_status,
            failed = status.failed_tasks, "dispatch phase finished");
        Ok(status)
    }

    async fn run_stages(
        &self,
        plan: &ExecutionPlan,
        order: &[&ExecutionStage],
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<(), ExecutionError> {
        if !self.run_gates(plan, GateTrigger::BeforeStart).await? {
            return Ok(());
        }

        for stage in order {
            if cancel.is_cancelled() {
                self.monitor.cancel(
                    &plan.plan_id,
                    format!("stopped before stage `{}`", stage.stage_id),
                )?;
                return Ok(());
            }
            if stage_has_deploy(plan, stage)
                && !self.run_gates(plan, GateTrigger::BeforeDeploy).await?
            {
                return Ok(());
            }

            let span = stage_span(trace_id, &stage.stage_id, stage.parallel_tasks.len());
            if !self.run_stage(plan, stage, cancel).instrument(span).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Dispatch one stage and wait for its barrier. `false` means the run
    /// was stopped inside the stage.
    async fn run_stage(
        &self,
        plan: &ExecutionPlan,
        stage: &ExecutionStage,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutionError> {
        let tasks: Vec<Task> = stage
            .parallel_tasks
            .iter()
            .filter_map(|id| plan.task(id).cloned())
            .collect();
        debug!(stage_id = %stage.stage_id, tasks = tasks.len(), "dispatching stage");

        let results = if self.settings.enforce_concurrency {
            let limit = stage.resource_requirements.max_concurrency as usize;
            self.dispatcher.dispatch_parallel_bounded(&tasks, limit).await
        } else {
            self.dispatcher.dispatch_parallel(&tasks).await
        };

        for settled in results {
            match settled.result {
                Ok(handle) => {
                    self.monitor.record_dispatch(&plan.plan_id, &handle)?;
                }
                Err(err) => {
                    warn!(stage_id = %stage.stage_id, task_id = %settled.task_id, error = %err,
                        "task dispatch failed");
                    self.monitor
                        .record_dispatch_failure(&plan.plan_id, &settled.task_id, err.to_string())?;
                }
            }
        }

        if self.settings.barrier == BarrierMode::Completion {
            return self.wait_for_stage(plan, stage, cancel).await;
        }
        Ok(true)
    }

    async fn wait_for_stage(
        &self,
        plan: &ExecutionPlan,
        stage: &ExecutionStage,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutionError> {
        let deadline = Instant::now() + self.settings.completion_timeout;
        loop {
            let status = self.monitor.poll(&plan.plan_id).await?;
            if all_terminal(&status, &stage.parallel_tasks) {
                return Ok(true);
            }
            if cancel.is_cancelled() {
                // The stage loop records the cancellation before the next stage.
                return Ok(true);
            }
            if Instant::now() >= deadline {
                self.monitor.abort(
                    &plan.plan_id,
                    format!(
                        "stage `{}` did not complete within {:?}",
                        stage.stage_id, self.settings.completion_timeout
                    ),
                )?;
                return Ok(false);
            }
            self.pause(cancel).await;
        }
    }

    /// Evaluate every gate for `trigger`. `false` means a required gate
    /// failed and the run was aborted.
    async fn run_gates(
        &self,
        plan: &ExecutionPlan,
        trigger: GateTrigger,
    ) -> Result<bool, ExecutionError> {
        for gate in plan.gates_for(trigger) {
            let snapshot = self.current(plan)?;
            let outcome = match self.gates.evaluate(gate, plan, &snapshot).await {
                Ok(outcome) => outcome,
                Err(err) => GateOutcome::fail(err.to_string()),
            };
            info!(plan_id = %plan.plan_id, gate_id = %gate.gate_id, %trigger,
                passed = outcome.passed, required = gate.required, "quality gate evaluated");

            let passed = outcome.passed;
            let message = outcome.message.clone();
            self.monitor
                .record_gate(&plan.plan_id, outcome.into_result(gate))?;
            if !passed && gate.required {
                self.monitor.abort(
                    &plan.plan_id,
                    format!(
                        "required quality gate `{}` ({trigger}) failed: {message}",
                        gate.gate_id
                    ),
                )?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }

    fn current(&self, plan: &ExecutionPlan) -> Result<ExecutionStatus, MonitorError> {
        self.monitor
            .status(&plan.plan_id)
            .ok_or_else(|| MonitorError::UnknownPlan(plan.plan_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cn_core::types::AgentDomain;

    fn task(id: &str) -> Task {
        Task::new(id, AgentDomain::backend(), "create_api")
    }

    #[test]
    fn order_follows_dependencies_then_declaration() {
        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a"), task("b"), task("c"), task("d")],
            vec![
                ExecutionStage::new("s3", vec!["c".into()]).after("s1").after("s2"),
                ExecutionStage::new("s1", vec!["a".into()]),
                ExecutionStage::new("s2", vec!["b".into()]),
                ExecutionStage::new("s4", vec!["d".into()]).after("s3"),
            ],
            vec![],
        );
        let ids: Vec<&str> = stage_order(&plan)
            .unwrap()
            .iter()
            .map(|s| s.stage_id.as_str())
            .collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4"]);
    }

    #[test]
    fn cycle_is_reported() {
        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a"), task("b"), task("c")],
            vec![
                ExecutionStage::new("s1", vec!["a".into()]),
                ExecutionStage::new("s2", vec!["b".into()]).after("s3"),
                ExecutionStage::new("s3", vec!["c".into()]).after("s2"),
            ],
            vec![],
        );
        assert_eq!(
            stage_order(&plan).unwrap_err(),
            ExecutionError::CyclicStageDependency {
                stages: vec!["s2".into(), "s3".into()]
            }
        );
    }

    #[test]
    fn duplicate_stage_id_is_reported() {
        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a"), task("b")],
            vec![
                ExecutionStage::new("s1", vec!["a".into()]),
                ExecutionStage::new("s1", vec!["b".into()]),
            ],
            vec![],
        );
        assert_eq!(
            stage_order(&plan).unwrap_err(),
            ExecutionError::DuplicateStage("s1".into())
        );
    }

    #[test]
    fn unknown_references_are_reported() {
        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a")],
            vec![ExecutionStage::new("s1", vec!["a".into()]).after("s0")],
            vec![],
        );
        assert!(matches!(
            stage_order(&plan),
            Err(ExecutionError::UnknownStage { ref dependency, .. }) if dependency == "s0"
        ));

        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a")],
            vec![ExecutionStage::new("s1", vec!["a".into(), "ghost".into()])],
            vec![],
        );
        assert!(matches!(
            stage_order(&plan),
            Err(ExecutionError::UnknownTask { ref task_id, .. }) if task_id == "ghost"
        ));
    }

    #[test]
    fn deploy_stage_detection() {
        let plan = ExecutionPlan::assemble(
            "cmd",
            vec![task("a"), Task::new("b", AgentDomain::devops(), "deploy_preview")],
            vec![
                ExecutionStage::new("s1", vec!["a".into()]),
                ExecutionStage::new("s2", vec!["b".into()]).after("s1"),
            ],
            vec![],
        );
        assert!(!stage_has_deploy(&plan, &plan.execution_stages[0]));
        assert!(stage_has_deploy(&plan, &plan.execution_stages[1]));
    }
}
