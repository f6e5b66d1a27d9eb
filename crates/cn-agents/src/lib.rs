pub mod cancel;
pub mod client;
pub mod dispatcher;
pub mod gates;
pub mod http_client;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod simulated;

pub use cancel::CancellationToken;
pub use client::{AgentClient, AgentClientError};
pub use dispatcher::{DispatchError, PerTaskResult, RetryPolicy, TaskDispatcher};
pub use gates::{
    GateError, GateOutcome, PassAllGates, QualityGateEvaluator, StaticGateEvaluator,
    ThresholdGateEvaluator,
};
pub use http_client::HttpAgentClient;
pub use monitor::{ExecutionMonitor, MonitorError, StatusUpdate, UpdateKind};
pub use orchestrator::{ExecutionReport, Orchestrator, OrchestratorError, RunMode};
pub use registry::{AgentClientRegistry, RegistryError};
pub use scheduler::{stage_order, ExecutionError, ExecutionScheduler, SchedulerSettings};
pub use simulated::SimulatedAgentClient;
