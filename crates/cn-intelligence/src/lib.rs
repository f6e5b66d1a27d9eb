pub mod json_repair;
pub mod llm;
pub mod planner;
pub mod prompts;
pub mod usage;

// Re-export the planning surface for convenience.
pub use llm::{
    AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole,
    MockProvider, OpenAiProvider,
};
pub use planner::{PlanningAdapter, PlanningError, ProviderSlot};
pub use prompts::PromptContext;
pub use usage::{UsageLedger, UsageRecord, UsageRecorder};
