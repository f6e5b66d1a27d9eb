//! LLM planning adapter: turns a [`Command`] into an [`ExecutionPlan`] draft.
//!
//! One primary model slot and at most one fallback. The fallback is tried
//! only after the primary fails in transport (network, timeout, 429, 5xx),
//! and never concurrently. Structural validation is not done here; callers
//! run the plan validator on the result.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use cn_core::config::PlannerConfig;
use cn_core::types::{
    Command, ExecutionPlan, ExecutionStage, PlanComplexity, PlanMetadata, QualityGate,
    StageResources, Task, TotalResources,
};
use cn_telemetry::metrics::{
    global_metrics, MetricsCollector, LLM_REQUESTS_TOTAL, LLM_REQUEST_DURATION_SECONDS,
    LLM_TOKENS_TOTAL,
};
use cn_telemetry::spans::operation_span;

use crate::json_repair::{repair_json, strip_code_fences};
use crate::llm::{provider_from_slot, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse};
use crate::prompts::{build_planning_messages, system_prompt, PromptContext};
use crate::usage::{NoopUsageRecorder, UsageRecord, UsageRecorder};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum PlanningError {
    /// No provider configured, or every attempted provider failed.
    #[error("planning model unavailable: {0}")]
    ModelUnavailable(String),

    /// The response could not be read as a plan, even after repair.
    #[error("could not parse plan: {0}")]
    ParseError(String),

    #[error("model `{model}` returned an empty response")]
    EmptyResponse { model: String },
}

impl PlanningError {
    fn from_llm(err: &LlmError, provider: &str) -> Self {
        match err {
            LlmError::ParseError(msg) => {
                PlanningError::ParseError(format!("{provider}: malformed API response: {msg}"))
            }
            other => PlanningError::ModelUnavailable(format!("{provider}: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderSlot
// ---------------------------------------------------------------------------

/// A provider plus the request settings used with it.
#[derive(Clone)]
pub struct ProviderSlot {
    pub provider: Arc<dyn LlmProvider>,
    pub config: LlmConfig,
}

impl ProviderSlot {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self { provider, config }
    }

    fn label(&self) -> String {
        format!("{}/{}", self.provider.name(), self.config.model)
    }
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PlanningAdapter
// ---------------------------------------------------------------------------

pub struct PlanningAdapter {
    primary: Option<ProviderSlot>,
    fallback: Option<ProviderSlot>,
    timeout: Duration,
    usage: Arc<dyn UsageRecorder>,
    metrics: &'static MetricsCollector,
}

impl PlanningAdapter {
    pub fn new(primary: ProviderSlot) -> Self {
        Self {
            primary: Some(primary),
            fallback: None,
            timeout: Duration::from_secs(60),
            usage: Arc::new(NoopUsageRecorder),
            metrics: global_metrics(),
        }
    }

    /// Adapter with no model; every call fails with `ModelUnavailable`.
    pub fn unconfigured() -> Self {
        Self {
            primary: None,
            fallback: None,
            timeout: Duration::from_secs(60),
            usage: Arc::new(NoopUsageRecorder),
            metrics: global_metrics(),
        }
    }

    /// Build slots from config. A slot whose provider cannot be constructed
    /// (e.g. its API key variable is unset) is skipped with a warning.
    pub fn from_config(config: &PlannerConfig) -> Self {
        let build = |slot: &cn_core::config::ModelSlotConfig, role: &str| {
            match provider_from_slot(slot) {
                Ok(provider) => Some(ProviderSlot::new(provider, LlmConfig::from(slot))),
                Err(e) => {
                    warn!(role, provider = %slot.provider, model = %slot.model, error = %e,
                        "planner slot unavailable");
                    None
                }
            }
        };

        let primary = build(&config.primary, "primary");
        let fallback = config.fallback.as_ref().and_then(|s| build(s, "fallback"));
        // A usable fallback stands in for a missing primary.
        let (primary, fallback) = match (primary, fallback) {
            (None, Some(fb)) => (Some(fb), None),
            other => other,
        };

        Self {
            primary,
            fallback,
            timeout: config.timeout(),
            usage: Arc::new(NoopUsageRecorder),
            metrics: global_metrics(),
        }
    }

    pub fn with_fallback(mut self, fallback: ProviderSlot) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_usage_recorder(mut self, usage: Arc<dyn UsageRecorder>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_metrics(mut self, metrics: &'static MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.primary.is_some()
    }

    /// Ask the model for a plan and complete the draft it returns.
    pub async fn plan(
        &self,
        command: &Command,
        ctx: &PromptContext,
    ) -> Result<ExecutionPlan, PlanningError> {
        let (span, trace_id) = operation_span("plan_command");
        async {
            debug!(command_id = %command.command_id, command_type = %command.command_type, %trace_id,
                "planning command");
            let messages = build_planning_messages(command, ctx);
            let (response, model) = self.complete_with_fallback(&messages, command).await?;
            let plan = parse_plan_response(&response.content, command, &model)?;
            info!(
                command_id = %command.command_id,
                plan_id = %plan.plan_id,
                model = %model,
                tasks = plan.tasks.len(),
                stages = plan.execution_stages.len(),
                "plan drafted"
            );
            Ok::<_, PlanningError>(plan)
        }
        .instrument(span)
        .await
    }

    /// Primary first, then the fallback once on transport failure. Returns
    /// the response and the configured model name of the slot that answered.
    async fn complete_with_fallback(
        &self,
        messages: &[LlmMessage],
        command: &Command,
    ) -> Result<(LlmResponse, String), PlanningError> {
        let primary = self.primary.as_ref().ok_or_else(|| {
            PlanningError::ModelUnavailable("no planning model configured".into())
        })?;

        let err = match self.call_slot(primary, messages, command).await {
            Ok(resp) => return Ok((resp, primary.config.model.clone())),
            Err(err) => err,
        };

        let Some(fallback) = self.fallback.as_ref().filter(|_| err.is_transport()) else {
            return Err(PlanningError::from_llm(&err, &primary.label()));
        };

        warn!(
            primary = %primary.label(),
            fallback = %fallback.label(),
            error = %err,
            "primary planning model failed, trying fallback"
        );
        match self.call_slot(fallback, messages, command).await {
            Ok(resp) => Ok((resp, fallback.config.model.clone())),
            Err(fb_err) if fb_err.is_transport() => Err(PlanningError::ModelUnavailable(format!(
                "{}: {err}; {}: {fb_err}",
                primary.label(),
                fallback.label()
            ))),
            Err(fb_err) => Err(PlanningError::from_llm(&fb_err, &fallback.label())),
        }
    }

    async fn call_slot(
        &self,
        slot: &ProviderSlot,
        messages: &[LlmMessage],
        command: &Command,
    ) -> Result<LlmResponse, LlmError> {
        let mut config = slot.config.clone();
        config.system_prompt = Some(system_prompt());
        let provider = slot.provider.name().to_string();
        let started = Instant::now();

        let result = match tokio::time::timeout(self.timeout, slot.provider.complete(messages, &config))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        };

        self.metrics
            .observe_since(LLM_REQUEST_DURATION_SECONDS, started);
        let outcome = match &result {
            Ok(_) => "success",
            Err(LlmError::Timeout) => "timeout",
            Err(_) => "error",
        };
        self.metrics
            .increment_counter(LLM_REQUESTS_TOTAL, &[("provider", provider.as_str()), ("outcome", outcome)]);

        if let Ok(resp) = &result {
            self.metrics.increment_counter_by(
                LLM_TOKENS_TOTAL,
                &[("provider", provider.as_str()), ("direction", "input")],
                resp.input_tokens,
            );
            self.metrics.increment_counter_by(
                LLM_TOKENS_TOTAL,
                &[("provider", provider.as_str()), ("direction", "output")],
                resp.output_tokens,
            );
            self.usage.record(UsageRecord::from_response(
                &provider,
                resp,
                started.elapsed().as_millis() as u64,
                Some(&command.command_id),
            ));
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// What the model is asked to return. Everything the orchestrator can
/// compute itself is optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDraft {
    #[serde(default)]
    plan_id: Option<String>,
    tasks: Vec<Task>,
    #[serde(default)]
    execution_stages: Vec<ExecutionStage>,
    #[serde(default)]
    quality_gates: Vec<QualityGate>,
    #[serde(default)]
    estimated_total_duration: Option<u32>,
    #[serde(default)]
    total_resource_requirements: Option<TotalResources>,
    #[serde(default)]
    metadata: Option<DraftMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftMetadata {
    #[serde(default)]
    complexity: Option<PlanComplexity>,
}

/// Parse model output into a completed plan for `command`.
///
/// Code fences are stripped first. If the JSON does not parse, the one-shot
/// [`repair_json`] pass runs and parsing is tried exactly once more.
pub fn parse_plan_response(
    content: &str,
    command: &Command,
    model: &str,
) -> Result<ExecutionPlan, PlanningError> {
    let body = strip_code_fences(content);
    if body.is_empty() {
        return Err(PlanningError::EmptyResponse {
            model: model.to_string(),
        });
    }

    let draft: PlanDraft = match serde_json::from_str(body) {
        Ok(draft) => draft,
        Err(first) => {
            debug!(error = %first, "plan JSON did not parse, attempting repair");
            let repaired = repair_json(body);
            serde_json::from_str(&repaired).map_err(|second| {
                PlanningError::ParseError(format!("{first} (after repair: {second})"))
            })?
        }
    };

    if draft.tasks.is_empty() {
        return Err(PlanningError::ParseError("plan contains no tasks".into()));
    }
    Ok(complete_draft(draft, command, model))
}

fn complete_draft(draft: PlanDraft, command: &Command, model: &str) -> ExecutionPlan {
    let mut stages = if draft.execution_stages.is_empty() {
        derive_stages(&draft.tasks)
    } else {
        draft.execution_stages
    };

    let durations: HashMap<&str, u32> = draft
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t.estimated_duration))
        .collect();
    for stage in &mut stages {
        if stage.estimated_duration == 0 {
            stage.estimated_duration = stage
                .parallel_tasks
                .iter()
                .filter_map(|id| durations.get(id.as_str()).copied())
                .max()
                .unwrap_or(0);
        }
    }

    let mut plan = ExecutionPlan {
        plan_id: draft
            .plan_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("plan-{}", Uuid::new_v4())),
        command_id: command.command_id.clone(),
        tasks: draft.tasks,
        execution_stages: stages,
        quality_gates: draft.quality_gates,
        estimated_total_duration: 0,
        total_resource_requirements: TotalResources::default(),
        metadata: PlanMetadata::default(),
    };

    plan.estimated_total_duration = draft
        .estimated_total_duration
        .unwrap_or_else(|| plan.execution_stages.iter().map(|s| s.estimated_duration).sum());
    plan.total_resource_requirements = draft
        .total_resource_requirements
        .unwrap_or_else(|| plan.computed_totals());
    plan.metadata = PlanMetadata {
        created_at: Utc::now(),
        complexity: draft
            .metadata
            .and_then(|m| m.complexity)
            .unwrap_or_else(|| PlanComplexity::from_task_count(plan.tasks.len())),
        agents_required: plan.agents_required(),
        ai_generated: true,
        model: Some(model.to_string()),
    };
    plan
}

/// Group tasks by dependency depth: depth-0 tasks form the first stage, and
/// every later stage depends on the one before it. Unknown dependencies and
/// cycles are left for the validator; such tasks land in the last stage.
pub fn derive_stages(tasks: &[Task]) -> Vec<ExecutionStage> {
    let index: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut depth: HashMap<&str, usize> = HashMap::new();

    fn depth_of<'a>(
        id: &'a str,
        index: &HashMap<&'a str, &'a Task>,
        depth: &mut HashMap<&'a str, usize>,
        visiting: &mut Vec<&'a str>,
    ) -> usize {
        if let Some(d) = depth.get(id) {
            return *d;
        }
        if visiting.contains(&id) {
            return index.len();
        }
        visiting.push(id);
        let d = index
            .get(id)
            .copied()
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter(|dep| index.contains_key(dep.as_str()))
                    .map(|dep| depth_of(dep.as_str(), index, depth, visiting) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        visiting.pop();
        depth.insert(id, d);
        d
    }

    let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for task in tasks {
        let mut visiting = Vec::new();
        let d = depth_of(task.task_id.as_str(), &index, &mut depth, &mut visiting);
        levels.entry(d).or_default().push(task.task_id.clone());
    }

    let mut stages: Vec<ExecutionStage> = Vec::with_capacity(levels.len());
    for (n, ids) in levels.into_values().enumerate() {
        let members: Vec<&Task> = ids
            .iter()
            .filter_map(|id| index.get(id.as_str()).copied())
            .collect();
        let budget = stage_budget_for(&members);
        let mut stage = ExecutionStage::new(format!("stage-{}", n + 1), ids);
        stage.resource_requirements = budget;
        if let Some(prev) = stages.last() {
            stage = stage.after(prev.stage_id.clone());
        }
        stages.push(stage);
    }
    stages
}

/// Budget for a derived stage: the defaults, raised to whatever the member
/// tasks need together. Concurrency stays at the default and is enforced at
/// dispatch time.
fn stage_budget_for(members: &[&Task]) -> StageResources {
    let defaults = StageResources::default();
    let cpu: f64 = members.iter().map(|t| t.resource_requirements.cpu).sum();
    let memory: f64 = members.iter().map(|t| t.resource_requirements.memory).sum();
    StageResources {
        max_cpu: defaults.max_cpu.max(cpu),
        max_memory: defaults.max_memory.max(memory),
        ..defaults
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
