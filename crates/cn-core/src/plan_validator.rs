//! Structural validation of an [`ExecutionPlan`].
//!
//! Checks run in a fixed order. The first check class that finds anything
//! wrong stops validation, but every instance within that class is reported.
//! Validation is pure: the plan is never reordered or patched.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::ExecutionPlan;

/// Slack for float sums that are expected to match exactly.
const FLOAT_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DuplicateTaskId,
    DuplicateStageId,
    UnknownDependency,
    CyclicDependency,
    StageMembership,
    StageOrdering,
    ResourceMismatch,
    StageBudgetExceeded,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ViolationKind::DuplicateTaskId => "duplicate_task_id",
            ViolationKind::DuplicateStageId => "duplicate_stage_id",
            ViolationKind::UnknownDependency => "unknown_dependency",
            ViolationKind::CyclicDependency => "cyclic_dependency",
            ViolationKind::StageMembership => "stage_membership",
            ViolationKind::StageOrdering => "stage_ordering",
            ViolationKind::ResourceMismatch => "resource_mismatch",
            ViolationKind::StageBudgetExceeded => "stage_budget_exceeded",
        };
        f.write_str(label)
    }
}

/// The plan is malformed and must be regenerated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanValidationError {
    /// The task dependency graph has a cycle. The closing task id is repeated
    /// at the end (`a -> b -> a`).
    #[error("cyclic task dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("structural violation ({kind}): {}", .details.join("; "))]
    StructuralViolation {
        kind: ViolationKind,
        details: Vec<String>,
    },
}

impl PlanValidationError {
    pub fn kind(&self) -> ViolationKind {
        match self {
            PlanValidationError::CyclicDependency { .. } => ViolationKind::CyclicDependency,
            PlanValidationError::StructuralViolation { kind, .. } => *kind,
        }
    }

    fn structural(kind: ViolationKind, details: Vec<String>) -> Self {
        PlanValidationError::StructuralViolation { kind, details }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Allowed absolute difference between declared and summed resource totals.
    pub resource_tolerance: f64,
    /// Check summed task cpu and memory against each stage's advisory
    /// ceilings. `maxConcurrency` is not checked here; the scheduler enforces
    /// it while dispatching.
    pub enforce_stage_budgets: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            resource_tolerance: 0.0,
            enforce_stage_budgets: true,
        }
    }
}

// ---------------------------------------------------------------------------
// PlanValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PlanValidator {
    options: ValidationOptions,
}

impl PlanValidator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Validate and hand the plan back unchanged.
    pub fn validate(&self, plan: ExecutionPlan) -> Result<ExecutionPlan, PlanValidationError> {
        validate_plan(&plan, &self.options)?;
        Ok(plan)
    }
}

/// Run every structural check against `plan`.
pub fn validate_plan(
    plan: &ExecutionPlan,
    options: &ValidationOptions,
) -> Result<(), PlanValidationError> {
    let result = check_unique_task_ids(plan)
        .and_then(|_| check_unique_stage_ids(plan))
        .and_then(|_| check_dependencies_exist(plan))
        .and_then(|_| check_acyclic(plan))
        .and_then(|_| check_stage_membership(plan))
        .and_then(|_| check_stage_ordering(plan))
        .and_then(|_| check_resource_totals(plan, options.resource_tolerance))
        .and_then(|_| {
            if options.enforce_stage_budgets {
                check_stage_budgets(plan)
            } else {
                Ok(())
            }
        });

    match &result {
        Ok(()) => debug!(
            plan_id = %plan.plan_id,
            tasks = plan.tasks.len(),
            stages = plan.execution_stages.len(),
            "plan validated"
        ),
        Err(e) => warn!(plan_id = %plan.plan_id, kind = %e.kind(), error = %e, "plan rejected"),
    }
    result
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_unique_task_ids(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let mut seen = HashSet::new();
    let mut details = Vec::new();
    for task in &plan.tasks {
        if !seen.insert(task.task_id.as_str()) {
            details.push(format!("task id `{}` is declared more than once", task.task_id));
        }
    }
    ok_or(ViolationKind::DuplicateTaskId, details)
}

fn check_unique_stage_ids(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let mut seen = HashSet::new();
    let mut details = Vec::new();
    for stage in &plan.execution_stages {
        if !seen.insert(stage.stage_id.as_str()) {
            details.push(format!("stage id `{}` is declared more than once", stage.stage_id));
        }
    }
    ok_or(ViolationKind::DuplicateStageId, details)
}

fn check_dependencies_exist(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let ids: HashSet<&str> = plan.tasks.iter().map(|t| t.task_id.as_str()).collect();
    let mut details = Vec::new();
    for task in &plan.tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                details.push(format!(
                    "task `{}` depends on unknown task `{}`",
                    task.task_id, dep
                ));
            }
        }
    }
    ok_or(ViolationKind::UnknownDependency, details)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn check_acyclic(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let edges: HashMap<&str, Vec<&str>> = plan
        .tasks
        .iter()
        .map(|t| {
            (
                t.task_id.as_str(),
                t.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let order: Vec<&str> = plan.tasks.iter().map(|t| t.task_id.as_str()).collect();

    match find_cycle(&order, &edges) {
        Some(cycle) => Err(PlanValidationError::CyclicDependency { cycle }),
        None => Ok(()),
    }
}

fn check_stage_membership(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let ids: HashSet<&str> = plan.tasks.iter().map(|t| t.task_id.as_str()).collect();
    let mut owners: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut details = Vec::new();

    for stage in &plan.execution_stages {
        for task_id in &stage.parallel_tasks {
            if !ids.contains(task_id.as_str()) {
                details.push(format!(
                    "stage `{}` lists unknown task `{}`",
                    stage.stage_id, task_id
                ));
            }
            owners
                .entry(task_id.as_str())
                .or_default()
                .push(stage.stage_id.as_str());
        }
    }

    for task in &plan.tasks {
        match owners.get(task.task_id.as_str()) {
            None => details.push(format!("task `{}` is not assigned to any stage", task.task_id)),
            Some(stages) if stages.len() > 1 => details.push(format!(
                "task `{}` appears {} times (stages: {})",
                task.task_id,
                stages.len(),
                stages.join(", ")
            )),
            Some(_) => {}
        }
    }

    ok_or(ViolationKind::StageMembership, details)
}

fn check_stage_ordering(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let stage_ids: HashSet<&str> = plan
        .execution_stages
        .iter()
        .map(|s| s.stage_id.as_str())
        .collect();
    let mut details = Vec::new();

    for stage in &plan.execution_stages {
        for dep in &stage.dependencies {
            if !stage_ids.contains(dep.as_str()) {
                details.push(format!(
                    "stage `{}` depends on unknown stage `{}`",
                    stage.stage_id, dep
                ));
            } else if dep == &stage.stage_id {
                details.push(format!("stage `{}` depends on itself", stage.stage_id));
            }
        }
    }
    if !details.is_empty() {
        return ok_or(ViolationKind::StageOrdering, details);
    }

    let edges: HashMap<&str, Vec<&str>> = plan
        .execution_stages
        .iter()
        .map(|s| {
            (
                s.stage_id.as_str(),
                s.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let order: Vec<&str> = plan
        .execution_stages
        .iter()
        .map(|s| s.stage_id.as_str())
        .collect();
    if let Some(cycle) = find_cycle(&order, &edges) {
        return ok_or(
            ViolationKind::StageOrdering,
            vec![format!("stage dependency cycle: {}", cycle.join(" -> "))],
        );
    }

    let ancestors = stage_ancestors(&order, &edges);
    for stage in &plan.execution_stages {
        let prior = &ancestors[stage.stage_id.as_str()];
        for task_id in &stage.parallel_tasks {
            let Some(task) = plan.task(task_id) else {
                continue;
            };
            for dep in &task.dependencies {
                let Some(owner) = plan.stage_of(dep) else {
                    continue;
                };
                if owner.stage_id == stage.stage_id {
                    details.push(format!(
                        "task `{}` depends on `{}` but both run in stage `{}`",
                        task_id, dep, stage.stage_id
                    ));
                } else if !prior.contains(owner.stage_id.as_str()) {
                    details.push(format!(
                        "task `{}` in stage `{}` depends on `{}` in stage `{}`, which is not a declared prior stage",
                        task_id, stage.stage_id, dep, owner.stage_id
                    ));
                }
            }
        }
    }

    ok_or(ViolationKind::StageOrdering, details)
}

fn check_resource_totals(plan: &ExecutionPlan, tolerance: f64) -> Result<(), PlanValidationError> {
    let computed = plan.computed_totals();
    let declared = plan.total_resource_requirements;
    let limit = tolerance.max(0.0) + FLOAT_EPSILON;
    let mut details = Vec::new();

    if (declared.total_cpu_units - computed.total_cpu_units).abs() > limit {
        details.push(format!(
            "totalCpuUnits is {} but tasks sum to {}",
            declared.total_cpu_units, computed.total_cpu_units
        ));
    }
    if (declared.total_memory_units - computed.total_memory_units).abs() > limit {
        details.push(format!(
            "totalMemoryUnits is {} but tasks sum to {}",
            declared.total_memory_units, computed.total_memory_units
        ));
    }

    ok_or(ViolationKind::ResourceMismatch, details)
}

fn check_stage_budgets(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    let mut details = Vec::new();

    for stage in &plan.execution_stages {
        let budget = stage.resource_requirements;
        let tasks: Vec<_> = stage
            .parallel_tasks
            .iter()
            .filter_map(|id| plan.task(id))
            .collect();
        let cpu: f64 = tasks.iter().map(|t| t.resource_requirements.cpu).sum();
        let memory: f64 = tasks.iter().map(|t| t.resource_requirements.memory).sum();

        if cpu > budget.max_cpu + FLOAT_EPSILON {
            details.push(format!(
                "stage `{}` needs {} cpu but maxCpu is {}",
                stage.stage_id, cpu, budget.max_cpu
            ));
        }
        if memory > budget.max_memory + FLOAT_EPSILON {
            details.push(format!(
                "stage `{}` needs {} memory but maxMemory is {}",
                stage.stage_id, memory, budget.max_memory
            ));
        }
    }

    ok_or(ViolationKind::StageBudgetExceeded, details)
}

// ---------------------------------------------------------------------------
// Graph helpers
// ---------------------------------------------------------------------------

/// Depth-first search for a cycle. Nodes are visited in `order` so the
/// reported cycle is deterministic. Edges to unknown nodes are ignored.
pub(crate) fn find_cycle<'a>(
    order: &[&'a str],
    edges: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<String>> {
    let mut marks: HashMap<&'a str, Mark> = order.iter().map(|n| (*n, Mark::Unvisited)).collect();
    let mut stack: Vec<&'a str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::InProgress);
        stack.push(node);
        for next in edges.get(node).into_iter().flatten() {
            match marks.get(next).copied() {
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Unvisited) => {
                    if let Some(cycle) = visit(*next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                Some(Mark::Done) | None => {}
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for node in order {
        if marks.get(node).copied() == Some(Mark::Unvisited) {
            if let Some(cycle) = visit(*node, edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Transitive set of prior stages for every stage. Assumes an acyclic graph.
fn stage_ancestors<'a>(
    order: &[&'a str],
    edges: &HashMap<&'a str, Vec<&'a str>>,
) -> HashMap<&'a str, HashSet<&'a str>> {
    fn collect<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, HashSet<&'a str>>,
    ) -> HashSet<&'a str> {
        if let Some(done) = memo.get(node) {
            return done.clone();
        }
        let mut out = HashSet::new();
        for dep in edges.get(node).into_iter().flatten() {
            out.insert(*dep);
            out.extend(collect(*dep, edges, memo));
        }
        memo.insert(node, out.clone());
        out
    }

    let mut memo = HashMap::new();
    for node in order {
        collect(*node, edges, &mut memo);
    }
    memo
}

fn ok_or(kind: ViolationKind, details: Vec<String>) -> Result<(), PlanValidationError> {
    if details.is_empty() {
        Ok(())
    } else {
        Err(PlanValidationError::structural(kind, details))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
