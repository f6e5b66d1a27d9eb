//! Full pipeline: raw command -> scripted model -> validated plan ->
//! simulated agents.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cn_agents::{
    AgentClientRegistry, CancellationToken, ExecutionMonitor, ExecutionScheduler, Orchestrator,
    OrchestratorError, PassAllGates, RetryPolicy, RunMode, SchedulerSettings,
    SimulatedAgentClient, TaskDispatcher,
};
use cn_core::config::{BarrierMode, Config};
use cn_core::plan_validator::{PlanValidator, ValidationOptions, ViolationKind};
use cn_core::types::{AgentDomain, OverallStatus, TaskStatus};
use cn_intelligence::llm::{LlmConfig, MockProvider};
use cn_intelligence::planner::{PlanningAdapter, ProviderSlot};
use cn_intelligence::prompts::PromptContext;
use cn_telemetry::metrics::MetricsCollector;

const BUTTON_PLAN: &str = r#"```json
{
  "tasks": [
    {"taskId": "t1", "agent": "frontend", "action": "create_component",
     "description": "Build the Button component", "payload": {"componentName": "Button"},
     "estimatedDuration": 15}
  ],
  "executionStages": [{"stageId": "s1", "parallelTasks": ["t1"]}]
}
```"#;

const BROKEN_STAGES_PLAN: &str = r#"{
  "tasks": [
    {"taskId": "t1", "agent": "backend", "action": "create_schema"},
    {"taskId": "t2", "agent": "backend", "action": "create_api", "dependencies": ["t1"]}
  ],
  "executionStages": [
    {"stageId": "s1", "parallelTasks": ["t1"]},
    {"stageId": "s2", "parallelTasks": ["t2"]}
  ]
}"#;

const WIDE_PLAN: &str = r#"{
  "tasks": [
    {"taskId": "w1", "agent": "frontend", "action": "create_component"},
    {"taskId": "w2", "agent": "frontend", "action": "create_component"},
    {"taskId": "w3", "agent": "frontend", "action": "create_component"},
    {"taskId": "w4", "agent": "frontend", "action": "create_component"},
    {"taskId": "w5", "agent": "frontend", "action": "create_component"},
    {"taskId": "w6", "agent": "frontend", "action": "create_component"}
  ]
}"#;

fn test_metrics() -> &'static MetricsCollector {
    Box::leak(Box::new(MetricsCollector::new()))
}

fn button_command() -> serde_json::Value {
    json!({
        "commandId": "cmd-button",
        "commandType": "create_component",
        "payload": {"componentName": "Button", "variants": ["primary", "ghost"]},
        "priority": "medium",
        "metadata": {"userId": "u-1", "projectId": "p-1"}
    })
}

struct Setup {
    orchestrator: Orchestrator,
    model: Arc<MockProvider>,
    frontend: Arc<SimulatedAgentClient>,
}

fn setup(plan_json: &str) -> Setup {
    let metrics = test_metrics();
    let model = Arc::new(MockProvider::named("openai").with_content("gpt-4o", plan_json));
    let planner = PlanningAdapter::new(ProviderSlot::new(
        model.clone(),
        LlmConfig {
            model: "gpt-4o".into(),
            ..LlmConfig::default()
        },
    ))
    .with_metrics(metrics);

    let frontend = Arc::new(SimulatedAgentClient::new(AgentDomain::frontend()));
    let registry = Arc::new(
        AgentClientRegistry::new()
            .with_client(frontend.clone())
            .with_client(Arc::new(SimulatedAgentClient::new(AgentDomain::backend())))
            .with_client(Arc::new(SimulatedAgentClient::new(AgentDomain::devops()))),
    );
    let dispatcher = Arc::new(
        TaskDispatcher::new(
            registry.clone(),
            RetryPolicy {
                timeout: Duration::from_secs(2),
                ..RetryPolicy::default()
            },
        )
        .with_metrics(metrics),
    );
    let monitor = Arc::new(ExecutionMonitor::new(registry));
    let scheduler = ExecutionScheduler::new(dispatcher, monitor, Arc::new(PassAllGates))
        .with_settings(SchedulerSettings {
            barrier: BarrierMode::Dispatch,
            enforce_concurrency: true,
            poll_interval: Duration::from_millis(5),
            completion_timeout: Duration::from_secs(5),
        })
        .with_metrics(metrics);

    Setup {
        orchestrator: Orchestrator::new(
            planner,
            PlanValidator::new(ValidationOptions::default()),
            scheduler,
        ),
        model,
        frontend,
    }
}

#[tokio::test]
async fn create_component_runs_end_to_end() {
    let s = setup(BUTTON_PLAN);

    let report = s
        .orchestrator
        .handle(&button_command(), &PromptContext::new())
        .await
        .expect("command handled");

    assert_eq!(report.plan.command_id, "cmd-button");
    assert!(report.plan.tasks.iter().any(|t| t.agent == AgentDomain::frontend()));
    assert_eq!(report.plan.metadata.model.as_deref(), Some("gpt-4o"));
    assert_eq!(s.frontend.accepted_tasks(), vec!["t1".to_string()]);
    assert_ne!(report.status.overall_status, OverallStatus::Failed);
    assert_eq!(report.status.plan_id, report.plan.plan_id);
    assert_eq!(s.model.call_count(), 1);
}

#[tokio::test]
async fn wide_stage_is_validated_and_dispatched_under_the_cap() {
    let s = setup(WIDE_PLAN);

    let report = s
        .orchestrator
        .handle(&button_command(), &PromptContext::new())
        .await
        .expect("wide plan accepted");

    assert_eq!(report.plan.execution_stages.len(), 1);
    assert_eq!(report.plan.execution_stages[0].parallel_tasks.len(), 6);
    let mut accepted = s.frontend.accepted_tasks();
    accepted.sort();
    assert_eq!(accepted, vec!["w1", "w2", "w3", "w4", "w5", "w6"]);
    assert!(s.frontend.peak_concurrent_dispatches() <= 4);
    assert_ne!(report.status.overall_status, OverallStatus::Failed);
}

#[tokio::test]
async fn completion_mode_waits_for_agents() {
    let s = setup(BUTTON_PLAN);

    let report = s
        .orchestrator
        .handle_with(
            &button_command(),
            &PromptContext::new(),
            RunMode::Completion,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status.overall_status, OverallStatus::Completed);
    assert_eq!(report.status.task("t1").unwrap().status, TaskStatus::Completed);
    let archived = s.orchestrator.monitor().archive(&report.plan.plan_id).unwrap();
    assert_eq!(archived.completed_tasks, 1);
}

#[tokio::test]
async fn schema_violation_stops_before_planning() {
    let s = setup(BUTTON_PLAN);
    let raw = json!({
        "commandId": "cmd-1",
        "commandType": "create_component",
        "payload": {"nested": {"not": "allowed"}},
    });

    let err = s
        .orchestrator
        .handle(&raw, &PromptContext::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Schema(violation) => {
            let fields: Vec<&str> = violation.violations.iter().map(|v| v.field.as_str()).collect();
            assert!(fields.contains(&"payload.nested"));
            assert!(fields.contains(&"priority"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(s.model.call_count(), 0);
}

#[tokio::test]
async fn structurally_broken_plan_is_never_dispatched() {
    let s = setup(BROKEN_STAGES_PLAN);
    let raw = json!({
        "commandId": "cmd-api",
        "commandType": "create_api_endpoint",
        "payload": {"resource": "orders"},
        "priority": "high"
    });

    let err = s
        .orchestrator
        .handle(&raw, &PromptContext::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Structural(e) => assert_eq!(e.kind(), ViolationKind::StageOrdering),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(s.orchestrator.monitor().plan_ids().is_empty());
}

#[tokio::test]
async fn missing_model_is_a_planning_error() {
    let s = setup(BUTTON_PLAN);
    let orchestrator = s.orchestrator.with_planner(PlanningAdapter::unconfigured());

    let err = orchestrator
        .handle(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Planning(_)));
}

#[tokio::test]
async fn plan_command_returns_validated_plan_only() {
    let s = setup(BUTTON_PLAN);
    let command = cn_core::command::validate_command(&button_command()).unwrap();

    let plan = s
        .orchestrator
        .plan_command(&command, &PromptContext::new())
        .await
        .unwrap();

    assert_eq!(plan.tasks.len(), 1);
    assert!(s.frontend.accepted_tasks().is_empty());
}

#[tokio::test]
async fn from_config_uses_simulated_agents_without_endpoints() {
    let config = Config::default();
    let registry = Arc::new(AgentClientRegistry::from_config(&config.agents, &config.dispatch));
    let orchestrator = Orchestrator::from_config(&config, registry, Arc::new(PassAllGates));
    let plan: cn_core::types::ExecutionPlan = {
        let command = cn_core::command::validate_command(&button_command()).unwrap();
        cn_intelligence::planner::parse_plan_response(BUTTON_PLAN, &command, "gpt-4o").unwrap()
    };

    let report = orchestrator
        .run_plan(plan, RunMode::Completion, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status.overall_status, OverallStatus::Completed);
}
