//! Planning adapter behaviour against scripted providers: fallback rules,
//! response cleanup and usage accounting.

use std::sync::Arc;
use std::time::Duration;

use cn_core::plan_validator::{validate_plan, ValidationOptions};
use cn_core::types::{AgentDomain, Command, CommandType, Priority};
use cn_intelligence::llm::{LlmConfig, LlmError, MockProvider};
use cn_intelligence::planner::{parse_plan_response, PlanningAdapter, PlanningError, ProviderSlot};
use cn_intelligence::prompts::PromptContext;
use cn_intelligence::usage::UsageLedger;
use cn_telemetry::metrics::{MetricsCollector, LLM_TOKENS_TOTAL};

const COMPONENT_PLAN: &str = r#"{
  "tasks": [
    {"taskId": "t1", "agent": "frontend", "action": "create_component",
     "description": "Build the Button component", "payload": {"componentName": "Button"},
     "estimatedDuration": 20}
  ],
  "executionStages": [{"stageId": "s1", "parallelTasks": ["t1"]}],
  "qualityGates": [{"gateId": "lint", "name": "lint", "trigger": "after_completion", "required": false}]
}"#;

fn button_command() -> Command {
    Command::new(CommandType::CreateComponent, Priority::Medium)
        .with_payload("componentName", serde_json::json!("Button"))
}

fn slot(provider: MockProvider, model: &str) -> (Arc<MockProvider>, ProviderSlot) {
    let provider = Arc::new(provider);
    let slot = ProviderSlot::new(
        provider.clone(),
        LlmConfig {
            model: model.to_string(),
            ..LlmConfig::default()
        },
    );
    (provider, slot)
}

fn test_metrics() -> &'static MetricsCollector {
    Box::leak(Box::new(MetricsCollector::new()))
}

#[tokio::test]
async fn primary_success_produces_valid_frontend_plan() {
    let (primary, primary_slot) =
        slot(MockProvider::named("openai").with_content("gpt-4o", COMPONENT_PLAN), "gpt-4o");
    let adapter = PlanningAdapter::new(primary_slot).with_metrics(test_metrics());

    let plan = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .expect("plan");

    assert!(plan.tasks.iter().any(|t| t.agent == AgentDomain::frontend()));
    assert_eq!(plan.metadata.model.as_deref(), Some("gpt-4o"));
    validate_plan(&plan, &ValidationOptions::default()).expect("plan validates");
    assert_eq!(primary.call_count(), 1);

    let (messages, config) = &primary.captured_requests()[0];
    assert!(config.system_prompt.as_deref().unwrap_or("").contains("executionStages"));
    assert!(messages.last().unwrap().content.contains("Button"));
}

#[tokio::test]
async fn primary_timeout_falls_back_once() {
    let (primary, primary_slot) = slot(
        MockProvider::named("openai")
            .with_delay(Duration::from_millis(500))
            .with_content("gpt-4o", COMPONENT_PLAN),
        "gpt-4o",
    );
    let (fallback, fallback_slot) = slot(
        MockProvider::named("openai").with_content("gpt-4o-mini", COMPONENT_PLAN),
        "gpt-4o-mini",
    );
    let ledger = Arc::new(UsageLedger::new());
    let metrics = test_metrics();
    let adapter = PlanningAdapter::new(primary_slot)
        .with_fallback(fallback_slot)
        .with_timeout(Duration::from_millis(50))
        .with_usage_recorder(ledger.clone())
        .with_metrics(metrics);

    let plan = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .expect("fallback plan");

    assert_eq!(plan.metadata.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
    // Only the call that answered produced usage.
    assert_eq!(ledger.len(), 1);
    assert_eq!(
        metrics.get_counter(LLM_TOKENS_TOTAL, &[("provider", "openai"), ("direction", "input")]),
        100
    );
}

#[tokio::test]
async fn server_error_triggers_fallback() {
    let (_, primary_slot) = slot(
        MockProvider::named("anthropic").with_error(LlmError::ApiError {
            status: 503,
            message: "overloaded".into(),
        }),
        "claude",
    );
    let (_, fallback_slot) = slot(
        MockProvider::named("openai").with_content("gpt-4o-mini", COMPONENT_PLAN),
        "gpt-4o-mini",
    );
    let adapter = PlanningAdapter::new(primary_slot)
        .with_fallback(fallback_slot)
        .with_metrics(test_metrics());
    let plan = adapter.plan(&button_command(), &PromptContext::new()).await.unwrap();
    assert_eq!(plan.metadata.model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn client_error_does_not_fall_back() {
    let (_, primary_slot) = slot(
        MockProvider::named("openai").with_error(LlmError::ApiError {
            status: 401,
            message: "bad key".into(),
        }),
        "gpt-4o",
    );
    let (fallback, fallback_slot) = slot(MockProvider::named("openai"), "gpt-4o-mini");
    let adapter = PlanningAdapter::new(primary_slot)
        .with_fallback(fallback_slot)
        .with_metrics(test_metrics());

    let err = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlanningError::ModelUnavailable(_)));
    assert_eq!(fallback.call_count(), 0);
}

#[tokio::test]
async fn both_slots_failing_is_model_unavailable() {
    let (_, primary_slot) = slot(MockProvider::new().with_error(LlmError::Timeout), "a");
    let (_, fallback_slot) =
        slot(MockProvider::new().with_error(LlmError::HttpError("refused".into())), "b");
    let adapter = PlanningAdapter::new(primary_slot)
        .with_fallback(fallback_slot)
        .with_metrics(test_metrics());

    let err = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();
    match err {
        PlanningError::ModelUnavailable(msg) => {
            assert!(msg.contains("timed out"));
            assert!(msg.contains("refused"));
        }
        other => panic!("expected ModelUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn unconfigured_adapter_is_model_unavailable() {
    let err = PlanningAdapter::unconfigured()
        .plan(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlanningError::ModelUnavailable(_)));
}

#[tokio::test]
async fn fenced_response_with_trailing_commas_is_repaired() {
    let messy = "```json\n{\"tasks\": [{\"taskId\": \"t1\", \"agent\": \"frontend\", \"action\": \"create_component\",},],}\n```";
    let (_, primary_slot) = slot(MockProvider::new().with_content("m", messy), "m");
    let adapter = PlanningAdapter::new(primary_slot).with_metrics(test_metrics());
    let plan = adapter.plan(&button_command(), &PromptContext::new()).await.unwrap();
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.execution_stages.len(), 1);
}

#[tokio::test]
async fn whitespace_response_is_empty_response() {
    let (_, primary_slot) = slot(MockProvider::new().with_content("m", "  \n "), "m");
    let adapter = PlanningAdapter::new(primary_slot).with_metrics(test_metrics());
    let err = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlanningError::EmptyResponse { .. }));
}

#[tokio::test]
async fn unparseable_response_is_not_retried_on_fallback() {
    let (_, primary_slot) = slot(MockProvider::new().with_content("m", "sorry, no"), "m");
    let (fallback, fallback_slot) = slot(MockProvider::new(), "f");
    let adapter = PlanningAdapter::new(primary_slot)
        .with_fallback(fallback_slot)
        .with_metrics(test_metrics());
    let err = adapter
        .plan(&button_command(), &PromptContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlanningError::ParseError(_)));
    assert_eq!(fallback.call_count(), 0);
}

#[test]
fn wide_plan_without_stages_passes_default_validation() {
    let tasks: Vec<String> = (1..=5)
        .map(|n| {
            format!(
                r#"{{"taskId": "c{n}", "agent": "frontend", "action": "create_component", "estimatedDuration": 10}}"#
            )
        })
        .collect();
    let raw = format!(r#"{{"tasks": [{}]}}"#, tasks.join(","));

    let plan = parse_plan_response(&raw, &button_command(), "gpt-4o").expect("plan parses");

    assert_eq!(plan.execution_stages.len(), 1);
    let stage = &plan.execution_stages[0];
    assert_eq!(stage.parallel_tasks.len(), 5);
    assert_eq!(stage.resource_requirements.max_cpu, 5.0);
    assert_eq!(stage.resource_requirements.max_concurrency, 4);
    validate_plan(&plan, &ValidationOptions::default()).expect("wide plan validates");
}
