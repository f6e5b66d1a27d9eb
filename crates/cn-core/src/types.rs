use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Category a [`CommandType`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Frontend,
    Backend,
    Devops,
    MultiAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    // --- Frontend ---
    CreateComponent,
    UpdateComponent,
    CreatePage,
    UpdateStyles,
    AddRoute,
    OptimizeAssets,

    // --- Backend ---
    CreateApiEndpoint,
    UpdateApiEndpoint,
    CreateDatabaseSchema,
    RunMigration,
    AddAuthentication,
    CreateService,

    // --- DevOps ---
    DeployApplication,
    RollbackDeployment,
    #[serde(rename = "configure_ci_cd")]
    ConfigureCiCd,
    SetupMonitoring,
    ScaleService,
    ConfigureEnvironment,

    // --- Multi-agent ---
    CreateFullStackFeature,
    GenerateProject,
    RefactorCodebase,
    RunTestSuite,
    SecurityAudit,
}

impl CommandType {
    pub const ALL: [CommandType; 23] = [
        CommandType::CreateComponent,
        CommandType::UpdateComponent,
        CommandType::CreatePage,
        CommandType::UpdateStyles,
        CommandType::AddRoute,
        CommandType::OptimizeAssets,
        CommandType::CreateApiEndpoint,
        CommandType::UpdateApiEndpoint,
        CommandType::CreateDatabaseSchema,
        CommandType::RunMigration,
        CommandType::AddAuthentication,
        CommandType::CreateService,
        CommandType::DeployApplication,
        CommandType::RollbackDeployment,
        CommandType::ConfigureCiCd,
        CommandType::SetupMonitoring,
        CommandType::ScaleService,
        CommandType::ConfigureEnvironment,
        CommandType::CreateFullStackFeature,
        CommandType::GenerateProject,
        CommandType::RefactorCodebase,
        CommandType::RunTestSuite,
        CommandType::SecurityAudit,
    ];

    pub fn category(&self) -> CommandCategory {
        use CommandType::*;
        match self {
            CreateComponent | UpdateComponent | CreatePage | UpdateStyles | AddRoute
            | OptimizeAssets => CommandCategory::Frontend,
            CreateApiEndpoint | UpdateApiEndpoint | CreateDatabaseSchema | RunMigration
            | AddAuthentication | CreateService => CommandCategory::Backend,
            DeployApplication | RollbackDeployment | ConfigureCiCd | SetupMonitoring
            | ScaleService | ConfigureEnvironment => CommandCategory::Devops,
            CreateFullStackFeature | GenerateProject | RefactorCodebase | RunTestSuite
            | SecurityAudit => CommandCategory::MultiAgent,
        }
    }

    /// Wire name, e.g. `create_component`.
    pub fn as_str(&self) -> &'static str {
        use CommandType::*;
        match self {
            CreateComponent => "create_component",
            UpdateComponent => "update_component",
            CreatePage => "create_page",
            UpdateStyles => "update_styles",
            AddRoute => "add_route",
            OptimizeAssets => "optimize_assets",
            CreateApiEndpoint => "create_api_endpoint",
            UpdateApiEndpoint => "update_api_endpoint",
            CreateDatabaseSchema => "create_database_schema",
            RunMigration => "run_migration",
            AddAuthentication => "add_authentication",
            CreateService => "create_service",
            DeployApplication => "deploy_application",
            RollbackDeployment => "rollback_deployment",
            ConfigureCiCd => "configure_ci_cd",
            SetupMonitoring => "setup_monitoring",
            ScaleService => "scale_service",
            ConfigureEnvironment => "configure_environment",
            CreateFullStackFeature => "create_full_stack_feature",
            GenerateProject => "generate_project",
            RefactorCodebase => "refactor_codebase",
            RunTestSuite => "run_test_suite",
            SecurityAudit => "security_audit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A caller-supplied request, decomposed into an [`ExecutionPlan`] by the
/// planner. Construct through [`crate::command::validate_command`] when the
/// input is untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: String,
    pub command_type: CommandType,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CommandMetadata>,
}

impl Command {
    pub fn new(command_type: CommandType, priority: Priority) -> Self {
        Self {
            command_id: format!("cmd-{}", Uuid::new_v4()),
            command_type,
            payload: serde_json::Map::new(),
            priority,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// AgentDomain
// ---------------------------------------------------------------------------

/// Name of the agent domain a task is routed to.
///
/// Open-ended on the wire: an unknown domain deserialises fine and is only
/// rejected when the dispatcher finds no client registered for it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentDomain(String);

impl AgentDomain {
    pub const FRONTEND: &'static str = "frontend";
    pub const BACKEND: &'static str = "backend";
    pub const DEVOPS: &'static str = "devops";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn frontend() -> Self {
        Self::new(Self::FRONTEND)
    }

    pub fn backend() -> Self {
        Self::new(Self::BACKEND)
    }

    pub fn devops() -> Self {
        Self::new(Self::DEVOPS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the three built-in domains.
    pub fn is_well_known(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::FRONTEND | Self::BACKEND | Self::DEVOPS
        )
    }
}

impl fmt::Display for AgentDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentDomain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default = "default_cpu_units")]
    pub cpu: f64,
    #[serde(default = "default_memory_units")]
    pub memory: f64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: default_cpu_units(),
            memory: default_memory_units(),
        }
    }
}

fn default_cpu_units() -> f64 {
    1.0
}
fn default_memory_units() -> f64 {
    512.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub agent: AgentDomain,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_group: Option<String>,
    /// Minutes.
    #[serde(default)]
    pub estimated_duration: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub resource_requirements: ResourceRequirements,
    /// An optional task's failure does not fail the plan.
    #[serde(default)]
    pub optional: bool,
}

impl Task {
    pub fn new(task_id: impl Into<String>, agent: AgentDomain, action: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent,
            action: action.into(),
            description: String::new(),
            payload: serde_json::Map::new(),
            dependencies: Vec::new(),
            custom_dependencies: None,
            deployment_group: None,
            estimated_duration: 0,
            priority: Priority::default(),
            status: TaskStatus::default(),
            resource_requirements: ResourceRequirements::default(),
            optional: false,
        }
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// Deploy-type tasks trigger `before_deploy` quality gates.
    pub fn is_deploy_action(&self) -> bool {
        self.deployment_group.is_some() || self.action.to_ascii_lowercase().contains("deploy")
    }
}

// ---------------------------------------------------------------------------
// ExecutionStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResources {
    pub max_cpu: f64,
    pub max_memory: f64,
    pub max_concurrency: u32,
}

impl Default for StageResources {
    fn default() -> Self {
        Self {
            max_cpu: 4.0,
            max_memory: 4096.0,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStage {
    pub stage_id: String,
    pub parallel_tasks: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_duration: u32,
    #[serde(default)]
    pub resource_requirements: StageResources,
}

impl ExecutionStage {
    pub fn new(stage_id: impl Into<String>, parallel_tasks: Vec<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            parallel_tasks,
            dependencies: Vec::new(),
            estimated_duration: 0,
            resource_requirements: StageResources::default(),
        }
    }

    pub fn after(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(stage_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTrigger {
    BeforeStart,
    BeforeDeploy,
    AfterCompletion,
}

impl fmt::Display for GateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GateTrigger::BeforeStart => "before_start",
            GateTrigger::BeforeDeploy => "before_deploy",
            GateTrigger::AfterCompletion => "after_completion",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGate {
    pub gate_id: String,
    #[serde(default)]
    pub name: String,
    pub trigger: GateTrigger,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl QualityGate {
    pub fn new(gate_id: impl Into<String>, trigger: GateTrigger, required: bool) -> Self {
        let gate_id = gate_id.into();
        Self {
            name: gate_id.clone(),
            gate_id,
            trigger,
            required,
            thresholds: None,
            description: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanComplexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

impl PlanComplexity {
    /// Derive a complexity class from the number of tasks in a plan.
    pub fn from_task_count(count: usize) -> Self {
        match count {
            0..=2 => PlanComplexity::Simple,
            3..=6 => PlanComplexity::Moderate,
            _ => PlanComplexity::Complex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalResources {
    pub max_parallel_tasks: u32,
    pub total_cpu_units: f64,
    pub total_memory_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub complexity: PlanComplexity,
    #[serde(default)]
    pub agents_required: BTreeSet<AgentDomain>,
    #[serde(default)]
    pub ai_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            complexity: PlanComplexity::default(),
            agents_required: BTreeSet::new(),
            ai_generated: false,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub command_id: String,
    pub tasks: Vec<Task>,
    pub execution_stages: Vec<ExecutionStage>,
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    #[serde(default)]
    pub estimated_total_duration: u32,
    #[serde(default)]
    pub total_resource_requirements: TotalResources,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl ExecutionPlan {
    /// Build a plan whose totals and metadata are derived from its tasks.
    pub fn assemble(
        command_id: impl Into<String>,
        tasks: Vec<Task>,
        execution_stages: Vec<ExecutionStage>,
        quality_gates: Vec<QualityGate>,
    ) -> Self {
        let mut plan = Self {
            plan_id: format!("plan-{}", Uuid::new_v4()),
            command_id: command_id.into(),
            tasks,
            execution_stages,
            quality_gates,
            estimated_total_duration: 0,
            total_resource_requirements: TotalResources::default(),
            metadata: PlanMetadata::default(),
        };
        plan.total_resource_requirements = plan.computed_totals();
        plan.estimated_total_duration = plan.execution_stages.iter().map(|s| s.estimated_duration).sum();
        plan.metadata.complexity = PlanComplexity::from_task_count(plan.tasks.len());
        plan.metadata.agents_required = plan.agents_required();
        plan
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn stage(&self, stage_id: &str) -> Option<&ExecutionStage> {
        self.execution_stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// The stage whose `parallel_tasks` contains `task_id` (first match).
    pub fn stage_of(&self, task_id: &str) -> Option<&ExecutionStage> {
        self.execution_stages
            .iter()
            .find(|s| s.parallel_tasks.iter().any(|t| t == task_id))
    }

    pub fn gates_for(&self, trigger: GateTrigger) -> impl Iterator<Item = &QualityGate> {
        self.quality_gates.iter().filter(move |g| g.trigger == trigger)
    }

    pub fn agents_required(&self) -> BTreeSet<AgentDomain> {
        self.tasks.iter().map(|t| t.agent.clone()).collect()
    }

    /// Totals as the sum of every task's requirements.
    pub fn computed_totals(&self) -> TotalResources {
        let max_parallel = self
            .execution_stages
            .iter()
            .map(|s| s.parallel_tasks.len() as u32)
            .max()
            .unwrap_or(0);
        TotalResources {
            max_parallel_tasks: max_parallel,
            total_cpu_units: self.tasks.iter().map(|t| t.resource_requirements.cpu).sum(),
            total_memory_units: self.tasks.iter().map(|t| t.resource_requirements.memory).sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch / progress
// ---------------------------------------------------------------------------

/// Acknowledgement that an agent client accepted a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchHandle {
    pub dispatch_id: String,
    pub task_id: String,
    pub agent: AgentDomain,
    pub estimated_completion_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub agent: AgentDomain,
    pub status: TaskStatus,
    /// 0..=100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl TaskProgress {
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            agent: task.agent.clone(),
            status: TaskStatus::Pending,
            progress: 0,
            started_at: None,
            estimated_completion: None,
            result: None,
            error: None,
            dispatch_id: None,
            optional: task.optional,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OverallStatus::Completed | OverallStatus::Failed | OverallStatus::Cancelled
        )
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OverallStatus::Pending => "pending",
            OverallStatus::InProgress => "in_progress",
            OverallStatus::Completed => "completed",
            OverallStatus::Failed => "failed",
            OverallStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub gate_id: String,
    pub trigger: GateTrigger,
    pub required: bool,
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

/// Live roll-up of one in-flight plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub plan_id: String,
    pub execution_id: String,
    pub overall_status: OverallStatus,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_tasks: usize,
    pub tasks: Vec<TaskProgress>,
    #[serde(default)]
    pub gate_results: Vec<GateResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionStatus {
    /// Fresh status with every task pending.
    pub fn for_plan(plan: &ExecutionPlan) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan.plan_id.clone(),
            execution_id: format!("exec-{}", Uuid::new_v4()),
            overall_status: OverallStatus::Pending,
            completed_tasks: 0,
            failed_tasks: 0,
            total_tasks: plan.tasks.len(),
            tasks: plan.tasks.iter().map(TaskProgress::pending).collect(),
            gate_results: Vec::new(),
            warnings: Vec::new(),
            abort_reason: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskProgress> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskProgress> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Recompute counters and `overall_status` from the task list.
    ///
    /// `failed` wins when a required gate failed, the run was aborted, or any
    /// non-optional task failed. `completed` requires every task terminal and
    /// every non-optional task completed. `cancelled` is sticky.
    pub fn recompute(&mut self) {
        self.completed_tasks = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        self.failed_tasks = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        self.updated_at = Utc::now();

        if self.overall_status == OverallStatus::Cancelled {
            return;
        }

        let gate_failed = self.gate_results.iter().any(|g| g.required && !g.passed);
        let required_task_failed = self
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Failed && !t.optional);

        self.overall_status = if gate_failed || self.abort_reason.is_some() || required_task_failed
        {
            OverallStatus::Failed
        } else if !self.tasks.is_empty()
            && self.tasks.iter().all(|t| {
                t.status == TaskStatus::Completed || (t.optional && t.status.is_terminal())
            })
        {
            OverallStatus::Completed
        } else if self
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Pending && t.dispatch_id.is_none())
        {
            OverallStatus::Pending
        } else {
            OverallStatus::InProgress
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> ExecutionPlan {
        let t1 = Task::new("t1", AgentDomain::frontend(), "create_component");
        let t2 = Task::new("t2", AgentDomain::devops(), "deploy_preview").depends_on("t1");
        ExecutionPlan::assemble(
            "cmd-1",
            vec![t1, t2],
            vec![
                ExecutionStage::new("s1", vec!["t1".into()]),
                ExecutionStage::new("s2", vec!["t2".into()]).after("s1"),
            ],
            vec![QualityGate::new("lint", GateTrigger::BeforeDeploy, true)],
        )
    }

    #[test]
    fn command_type_wire_names_roundtrip() {
        for ty in CommandType::ALL {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
            assert_eq!(CommandType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(CommandType::ALL.len(), 23);
    }

    #[test]
    fn command_categories() {
        assert_eq!(CommandType::CreateComponent.category(), CommandCategory::Frontend);
        assert_eq!(CommandType::RunMigration.category(), CommandCategory::Backend);
        assert_eq!(CommandType::ConfigureCiCd.category(), CommandCategory::Devops);
        assert_eq!(CommandType::GenerateProject.category(), CommandCategory::MultiAgent);
    }

    #[test]
    fn task_defaults_apply_on_deserialize() {
        let task: Task = serde_json::from_str(
            r#"{"taskId":"t1","agent":"frontend","action":"create_component"}"#,
        )
        .unwrap();
        assert!(task.dependencies.is_empty());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.resource_requirements, ResourceRequirements::default());
        assert!(!task.optional);
    }

    #[test]
    fn unknown_agent_domain_deserializes() {
        let task: Task =
            serde_json::from_str(r#"{"taskId":"t1","agent":"ml","action":"train"}"#).unwrap();
        assert_eq!(task.agent.as_str(), "ml");
        assert!(!task.agent.is_well_known());
    }

    #[test]
    fn deploy_detection() {
        let mut task = Task::new("t", AgentDomain::devops(), "Deploy_Preview");
        assert!(task.is_deploy_action());
        task.action = "build".into();
        assert!(!task.is_deploy_action());
        task.deployment_group = Some("blue".into());
        assert!(task.is_deploy_action());
    }

    #[test]
    fn assemble_computes_totals() {
        let plan = sample_plan();
        assert_eq!(plan.total_resource_requirements.total_cpu_units, 2.0);
        assert_eq!(plan.total_resource_requirements.total_memory_units, 1024.0);
        assert_eq!(plan.total_resource_requirements.max_parallel_tasks, 1);
        assert_eq!(plan.metadata.agents_required.len(), 2);
        assert_eq!(plan.stage_of("t2").unwrap().stage_id, "s2");
    }

    #[test]
    fn plan_json_roundtrip_preserves_fields() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn status_rollup_rules() {
        let plan = sample_plan();
        let mut status = ExecutionStatus::for_plan(&plan);
        status.recompute();
        assert_eq!(status.overall_status, OverallStatus::Pending);

        status.task_mut("t1").unwrap().status = TaskStatus::Completed;
        status.recompute();
        assert_eq!(status.overall_status, OverallStatus::InProgress);

        status.task_mut("t2").unwrap().status = TaskStatus::Completed;
        status.recompute();
        assert_eq!(status.overall_status, OverallStatus::Completed);
        assert_eq!(status.completed_tasks, 2);
    }

    #[test]
    fn optional_task_failure_does_not_fail_plan() {
        let plan = sample_plan();
        let mut status = ExecutionStatus::for_plan(&plan);
        status.task_mut("t1").unwrap().status = TaskStatus::Completed;
        let t2 = status.task_mut("t2").unwrap();
        t2.optional = true;
        t2.status = TaskStatus::Failed;
        status.recompute();
        assert_eq!(status.overall_status, OverallStatus::Completed);
        assert_eq!(status.failed_tasks, 1);
    }

    #[test]
    fn required_task_failure_fails_plan() {
        let plan = sample_plan();
        let mut status = ExecutionStatus::for_plan(&plan);
        status.task_mut("t1").unwrap().status = TaskStatus::Failed;
        status.recompute();
        assert_eq!(status.overall_status, OverallStatus::Failed);
    }

    #[test]
    fn progress_is_clamped() {
        let task = Task::new("t", AgentDomain::backend(), "x");
        assert_eq!(TaskProgress::pending(&task).with_progress(250).progress, 100);
    }
}
