use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use cn_agents::{AgentClientRegistry, CancellationToken, RunMode};
use cn_core::config::Config;
use cn_core::types::OverallStatus;
use cn_intelligence::usage::UsageLedger;

use super::emit_json;
use super::plan::{log_usage, orchestrator, prompt_context};
use super::validate::{load_command, load_plan};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plan_file: Option<PathBuf>,
    pub wait: bool,
    pub simulate: bool,
}

pub fn registry_for(config: &Config, simulate: bool) -> AgentClientRegistry {
    if simulate {
        AgentClientRegistry::simulated_defaults()
    } else {
        AgentClientRegistry::from_config(&config.agents, &config.dispatch)
    }
}

pub async fn run(file: &Path, opts: &RunOptions, config: &Config) -> anyhow::Result<()> {
    let command = load_command(file)?;
    let registry = Arc::new(registry_for(config, opts.simulate));
    let ledger = Arc::new(UsageLedger::new());
    let orchestrator = orchestrator(config, registry.clone(), ledger.clone());

    let plan = match &opts.plan_file {
        Some(path) => {
            let plan = load_plan(path, config)?;
            if plan.command_id != command.command_id {
                warn!(plan_command = %plan.command_id, command = %command.command_id,
                    "plan was made for a different command");
            }
            plan
        }
        None => {
            let plan = orchestrator
                .plan_command(&command, &prompt_context(config, &registry))
                .await?;
            log_usage(&ledger);
            plan
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, no further stages will start");
            on_interrupt.cancel();
        }
    });

    let mode = if opts.wait {
        RunMode::Completion
    } else {
        RunMode::Dispatch
    };
    let report = orchestrator.run_plan(plan, mode, &cancel).await?;
    emit_json(&report, None)?;

    match report.status.overall_status {
        OverallStatus::Failed => anyhow::bail!(
            "execution failed: {}",
            report
                .status
                .abort_reason
                .clone()
                .unwrap_or_else(|| format!("{} task(s) failed", report.status.failed_tasks))
        ),
        OverallStatus::Cancelled => anyhow::bail!("execution cancelled"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn simulate_ignores_configured_endpoints() {
        let mut config = Config::default();
        config.agents.endpoints = BTreeMap::from([(
            "backend".to_string(),
            "http://localhost:7001".to_string(),
        )]);
        assert_eq!(registry_for(&config, true).len(), 3);
        assert_eq!(registry_for(&config, false).len(), 1);
    }

    #[tokio::test]
    async fn plan_file_runs_on_simulated_agents() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = dir.path().join("cmd.json");
        std::fs::write(
            &cmd,
            r#"{"commandId": "c1", "commandType": "create_api_endpoint", "payload": {}, "priority": "low"}"#,
        )
        .unwrap();
        let plan = dir.path().join("plan.json");
        std::fs::write(
            &plan,
            r#"{
              "planId": "p1", "commandId": "c1",
              "tasks": [{"taskId": "api", "agent": "backend", "action": "create_api"}],
              "executionStages": [{"stageId": "s1", "parallelTasks": ["api"]}],
              "totalResourceRequirements": {"maxParallelTasks": 1, "totalCpuUnits": 1, "totalMemoryUnits": 512},
              "metadata": {"createdAt": "2026-01-01T00:00:00Z"}
            }"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.scheduler.poll_interval_ms = 5;
        let opts = RunOptions {
            plan_file: Some(plan),
            wait: true,
            simulate: true,
        };
        run(&cmd, &opts, &config).await.unwrap();
    }
}
