//! End-to-end entry point: raw command in, execution status out.
//!
//! validate command -> plan -> validate plan -> execute. Everything before
//! dispatch fails with an [`OrchestratorError`]; once dispatch has started the
//! caller gets an [`ExecutionReport`] whatever happened to the tasks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use cn_core::command::{validate_command, SchemaViolation};
use cn_core::config::Config;
use cn_core::plan_validator::{PlanValidationError, PlanValidator};
use cn_core::types::{Command, ExecutionPlan, ExecutionStatus};
use cn_intelligence::planner::{PlanningAdapter, PlanningError};
use cn_intelligence::prompts::PromptContext;

use crate::cancel::CancellationToken;
use crate::dispatcher::TaskDispatcher;
use crate::gates::QualityGateEvaluator;
use crate::monitor::ExecutionMonitor;
use crate::registry::AgentClientRegistry;
use crate::scheduler::{ExecutionError, ExecutionScheduler, SchedulerSettings};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Structural(#[from] PlanValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// How far [`Orchestrator::run_plan`] goes before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Return after the last stage's barrier.
    #[default]
    Dispatch,
    /// Also wait for every task to finish and run `after_completion` gates.
    Completion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub plan: ExecutionPlan,
    pub status: ExecutionStatus,
}

pub struct Orchestrator {
    planner: PlanningAdapter,
    validator: PlanValidator,
    scheduler: ExecutionScheduler,
}

impl Orchestrator {
    pub fn new(
        planner: PlanningAdapter,
        validator: PlanValidator,
        scheduler: ExecutionScheduler,
    ) -> Self {
        Self {
            planner,
            validator,
            scheduler,
        }
    }

    /// Wire every component from `config` around the given agent registry.
    pub fn from_config(
        config: &Config,
        registry: Arc<AgentClientRegistry>,
        gates: Arc<dyn QualityGateEvaluator>,
    ) -> Self {
        let dispatcher = Arc::new(TaskDispatcher::from_config(registry.clone(), &config.dispatch));
        let monitor = Arc::new(ExecutionMonitor::new(registry));
        let scheduler = ExecutionScheduler::new(dispatcher, monitor, gates)
            .with_settings(SchedulerSettings::from(&config.scheduler));
        Self::new(
            PlanningAdapter::from_config(&config.planner),
            PlanValidator::new(config.validation.options()),
            scheduler,
        )
    }

    pub fn with_planner(mut self, planner: PlanningAdapter) -> Self {
        self.planner = planner;
        self
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        self.scheduler.monitor()
    }

    /// Plan a validated command and check the plan's structure.
    pub async fn plan_command(
        &self,
        command: &Command,
        ctx: &PromptContext,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        let draft = self.planner.plan(command, ctx).await?;
        let plan = self.validator.validate(draft)?;
        info!(command_id = %command.command_id, plan_id = %plan.plan_id, "plan accepted");
        Ok(plan)
    }

    /// Validate, plan and dispatch a raw command.
    pub async fn handle(
        &self,
        raw: &Value,
        ctx: &PromptContext,
    ) -> Result<ExecutionReport, OrchestratorError> {
        self.handle_with(raw, ctx, RunMode::Dispatch, &CancellationToken::new())
            .await
    }

    pub async fn handle_with(
        &self,
        raw: &Value,
        ctx: &PromptContext,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let command = validate_command(raw)?;
        let plan = self.plan_command(&command, ctx).await?;
        self.run_plan(plan, mode, cancel).await
    }

    /// Execute a plan that did not come from the planner, e.g. one loaded
    /// from a file. It is validated first.
    pub async fn run_plan(
        &self,
        plan: ExecutionPlan,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let plan = self.validator.validate(plan)?;
        let status = match mode {
            RunMode::Dispatch => self.scheduler.execute_with_cancel(&plan, cancel).await?,
            RunMode::Completion => {
                self.scheduler
                    .run_to_completion_with_cancel(&plan, cancel)
                    .await?
            }
        };
        Ok(ExecutionReport { plan, status })
    }
}
