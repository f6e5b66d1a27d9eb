use cn_core::plan_validator::{
    validate_plan, PlanValidationError, PlanValidator, ValidationOptions, ViolationKind,
};
use cn_core::types::{
    AgentDomain, ExecutionPlan, ExecutionStage, GateTrigger, QualityGate, Task,
};

fn full_stack_plan() -> ExecutionPlan {
    let schema = Task::new("t1", AgentDomain::backend(), "create_database_schema");
    let api = Task::new("t2", AgentDomain::backend(), "create_api_endpoint").depends_on("t1");
    let ui = Task::new("t3", AgentDomain::frontend(), "create_component").depends_on("t2");
    let deploy = Task::new("t4", AgentDomain::devops(), "deploy_application")
        .depends_on("t2")
        .depends_on("t3");
    ExecutionPlan::assemble(
        "cmd-full-stack",
        vec![schema, api, ui, deploy],
        vec![
            ExecutionStage::new("s1", vec!["t1".into()]),
            ExecutionStage::new("s2", vec!["t2".into()]).after("s1"),
            ExecutionStage::new("s3", vec!["t3".into()]).after("s2"),
            ExecutionStage::new("s4", vec!["t4".into()]).after("s3"),
        ],
        vec![QualityGate::new("tests-pass", GateTrigger::BeforeDeploy, true)],
    )
}

#[test]
fn well_formed_plan_is_returned_unchanged() {
    let plan = full_stack_plan();
    let validator = PlanValidator::default();
    let out = validator.validate(plan.clone()).expect("plan is valid");
    assert_eq!(out, plan);
}

#[test]
fn validation_is_idempotent() {
    let plan = full_stack_plan();
    let opts = ValidationOptions::default();
    assert!(validate_plan(&plan, &opts).is_ok());
    assert!(validate_plan(&plan, &opts).is_ok());

    let mut broken = plan;
    broken.execution_stages[1].dependencies.clear();
    let first = validate_plan(&broken, &opts).unwrap_err();
    let second = validate_plan(&broken, &opts).unwrap_err();
    assert_eq!(first, second);
}

#[test]
fn missing_stage_dependency_is_structural_violation() {
    // t2 depends on t1 but s2 does not declare s1.
    let plan = ExecutionPlan::assemble(
        "cmd-b",
        vec![
            Task::new("t1", AgentDomain::backend(), "create_service"),
            Task::new("t2", AgentDomain::frontend(), "create_page").depends_on("t1"),
        ],
        vec![
            ExecutionStage::new("s1", vec!["t1".into()]),
            ExecutionStage::new("s2", vec!["t2".into()]),
        ],
        vec![],
    );
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    match err {
        PlanValidationError::StructuralViolation { kind, details } => {
            assert_eq!(kind, ViolationKind::StageOrdering);
            assert_eq!(details.len(), 1);
            assert!(details[0].contains("t2"));
            assert!(details[0].contains("s1"));
        }
        other => panic!("expected structural violation, got {other:?}"),
    }
}

#[test]
fn inserting_back_edge_creates_cycle() {
    let mut plan = full_stack_plan();
    plan.tasks[0].dependencies.push("t4".into());
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    match err {
        PlanValidationError::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"t4".to_string()));
            assert!(cycle.contains(&"t1".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[test]
fn single_task_single_stage_is_valid() {
    let plan = ExecutionPlan::assemble(
        "cmd-one",
        vec![Task::new("only", AgentDomain::frontend(), "create_component")],
        vec![ExecutionStage::new("s1", vec!["only".into()])],
        vec![],
    );
    validate_plan(&plan, &ValidationOptions::default()).expect("single task plan is valid");
}

#[test]
fn task_outside_every_stage_is_rejected() {
    let mut plan = full_stack_plan();
    plan.execution_stages[3].parallel_tasks.clear();
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::StageMembership);
    assert!(err.to_string().contains("t4"));
}

#[test]
fn task_in_two_stages_is_rejected() {
    let mut plan = full_stack_plan();
    plan.execution_stages[3].parallel_tasks.push("t3".into());
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::StageMembership);
}

#[test]
fn stage_listing_unknown_task_is_rejected() {
    let mut plan = full_stack_plan();
    plan.execution_stages[0].parallel_tasks.push("ghost".into());
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::StageMembership);
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn unknown_stage_dependency_is_rejected() {
    let mut plan = full_stack_plan();
    plan.execution_stages[0].dependencies.push("s0".into());
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::StageOrdering);
}

#[test]
fn declared_totals_must_match_tasks() {
    let mut plan = full_stack_plan();
    plan.total_resource_requirements.total_memory_units = 1.0;
    let err = validate_plan(&plan, &ValidationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ViolationKind::ResourceMismatch);
    assert!(err.to_string().contains("totalMemoryUnits"));
}

#[test]
fn plan_deserialized_from_json_validates() {
    let raw = r#"{
        "planId": "plan-json",
        "commandId": "cmd-json",
        "tasks": [
            {"taskId": "a", "agent": "frontend", "action": "create_component"},
            {"taskId": "b", "agent": "devops", "action": "deploy_application", "dependencies": ["a"]}
        ],
        "executionStages": [
            {"stageId": "s1", "parallelTasks": ["a"]},
            {"stageId": "s2", "parallelTasks": ["b"], "dependencies": ["s1"]}
        ],
        "totalResourceRequirements": {"maxParallelTasks": 1, "totalCpuUnits": 2, "totalMemoryUnits": 1024}
    }"#;
    let plan: ExecutionPlan = serde_json::from_str(raw).expect("parse plan");
    validate_plan(&plan, &ValidationOptions::default()).expect("plan is valid");
}
