use std::path::Path;
use std::sync::Arc;

use tracing::info;

use cn_agents::{AgentClientRegistry, Orchestrator, ThresholdGateEvaluator};
use cn_core::config::Config;
use cn_intelligence::planner::PlanningAdapter;
use cn_intelligence::prompts::PromptContext;
use cn_intelligence::usage::UsageLedger;

use super::emit_json;
use super::validate::load_command;

/// Build the orchestrator for `registry`, with usage going to `ledger`.
pub fn orchestrator(
    config: &Config,
    registry: Arc<AgentClientRegistry>,
    ledger: Arc<UsageLedger>,
) -> Orchestrator {
    Orchestrator::from_config(config, registry, Arc::new(ThresholdGateEvaluator)).with_planner(
        PlanningAdapter::from_config(&config.planner).with_usage_recorder(ledger),
    )
}

/// Prompt context advertising the agents that can actually be reached.
pub fn prompt_context(config: &Config, registry: &AgentClientRegistry) -> PromptContext {
    let mut ctx = PromptContext::new().with_agents(registry.domains());
    ctx.project_id = Some(config.general.project_name.clone());
    ctx
}

pub fn log_usage(ledger: &UsageLedger) {
    if ledger.is_empty() {
        return;
    }
    let totals = ledger.totals();
    info!(
        requests = totals.requests,
        input_tokens = totals.input_tokens,
        output_tokens = totals.output_tokens,
        "planning usage"
    );
}

pub async fn run(file: &Path, out: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    let command = load_command(file)?;
    let registry = Arc::new(AgentClientRegistry::from_config(&config.agents, &config.dispatch));
    let ledger = Arc::new(UsageLedger::new());
    let orchestrator = orchestrator(config, registry.clone(), ledger.clone());

    let plan = orchestrator
        .plan_command(&command, &prompt_context(config, &registry))
        .await?;
    log_usage(&ledger);
    emit_json(&plan, out)?;
    if let Some(path) = out {
        println!(
            "plan `{}` ({} tasks, {} stages) written to {}",
            plan.plan_id,
            plan.tasks.len(),
            plan.execution_stages.len(),
            path.display()
        );
    }
    Ok(())
}
