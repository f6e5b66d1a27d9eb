//! Prompt assembly for the planning call.
//!
//! Conversation history is owned by the caller and handed in through
//! [`PromptContext`]; nothing here keeps state between calls.

use serde::{Deserialize, Serialize};

use cn_core::types::{AgentDomain, Command, CommandCategory};

use crate::llm::LlmMessage;

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are the planning component of a multi-agent software delivery orchestrator.
Decompose the user's command into an execution plan for specialised agents.

Respond with a single JSON object and nothing else, shaped like:
{
  "tasks": [
    {
      "taskId": "t1",
      "agent": "frontend | backend | devops",
      "action": "short_snake_case_action",
      "description": "what the agent must do",
      "payload": { },
      "dependencies": ["ids of tasks that must finish first"],
      "estimatedDuration": 10,
      "priority": "low | medium | high | critical",
      "resourceRequirements": { "cpu": 1, "memory": 512 }
    }
  ],
  "executionStages": [
    {
      "stageId": "stage-1",
      "parallelTasks": ["t1"],
      "dependencies": [],
      "estimatedDuration": 10,
      "resourceRequirements": { "maxCpu": 4, "maxMemory": 4096, "maxConcurrency": 4 }
    }
  ],
  "qualityGates": [
    { "gateId": "g1", "name": "tests pass", "trigger": "before_start | before_deploy | after_completion", "required": true }
  ]
}"#;

/// Rules repeated to every model; plans that break them are rejected.
pub const PLANNER_GUARDRAILS: &str = "Rules:
- Every task id is unique and every task appears in exactly one stage.
- A task may only depend on tasks that exist, and the graph must be acyclic.
- A task's dependencies must live in stages listed (directly or transitively) in its own stage's dependencies. Never depend on a task in the same stage.
- Tasks inside one stage run in parallel, so only group independent work.
- Deployment tasks go in their own stage after everything they ship.
- Only use the agent domains listed as available.";

/// Caller-owned context for one planning request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Prior turns of the session, oldest first.
    #[serde(default)]
    pub history: Vec<LlmMessage>,
    /// Domains the planner may assign tasks to. Empty means the three defaults.
    #[serde(default)]
    pub available_agents: Vec<AgentDomain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AgentDomain>) -> Self {
        self.available_agents = agents.into_iter().collect();
        self
    }

    pub fn with_history(mut self, history: Vec<LlmMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    fn agent_names(&self) -> Vec<String> {
        if self.available_agents.is_empty() {
            vec![
                AgentDomain::FRONTEND.to_string(),
                AgentDomain::BACKEND.to_string(),
                AgentDomain::DEVOPS.to_string(),
            ]
        } else {
            self.available_agents.iter().map(|a| a.to_string()).collect()
        }
    }
}

/// Typical task shapes for each command category.
pub fn task_template_guidance(category: CommandCategory) -> &'static str {
    match category {
        CommandCategory::Frontend => {
            "Typical shape: frontend builds the UI piece, optionally devops deploys a preview once it exists."
        }
        CommandCategory::Backend => {
            "Typical shape: backend defines data schema first, then endpoints or services on top of it, then migrations."
        }
        CommandCategory::Devops => {
            "Typical shape: devops prepares environment and configuration before deploying, scaling or monitoring."
        }
        CommandCategory::MultiAgent => {
            "Typical shape: backend schema and API first, frontend consumes the API next, devops deploys last behind a before_deploy quality gate."
        }
    }
}

/// Messages for one planning call: history, then the command itself.
/// The system prompt travels in [`crate::llm::LlmConfig::system_prompt`].
pub fn build_planning_messages(command: &Command, ctx: &PromptContext) -> Vec<LlmMessage> {
    let mut messages = ctx.history.clone();

    let command_json =
        serde_json::to_string_pretty(command).unwrap_or_else(|_| command.command_id.clone());

    let mut user = format!(
        "Command type: {} ({:?})\n{}\n\nAvailable agents: {}\n",
        command.command_type,
        command.command_type.category(),
        task_template_guidance(command.command_type.category()),
        ctx.agent_names().join(", "),
    );
    if let Some(project) = ctx
        .project_id
        .as_deref()
        .or_else(|| command.metadata.as_ref().and_then(|m| m.project_id.as_deref()))
    {
        user.push_str(&format!("Project: {project}\n"));
    }
    if let Some(extra) = &ctx.instructions {
        user.push_str(&format!("Additional instructions: {extra}\n"));
    }
    user.push_str(&format!("\n{PLANNER_GUARDRAILS}\n\nCommand:\n{command_json}"));

    messages.push(LlmMessage::user(user));
    messages
}

/// Full system prompt.
pub fn system_prompt() -> String {
    format!("{PLANNER_SYSTEM_PROMPT}\n\n{PLANNER_GUARDRAILS}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmRole;
    use cn_core::types::{CommandType, Priority};

    #[test]
    fn message_carries_command_and_agents() {
        let cmd = Command::new(CommandType::CreateComponent, Priority::Medium)
            .with_payload("componentName", serde_json::json!("Button"));
        let msgs = build_planning_messages(&cmd, &PromptContext::new());
        assert_eq!(msgs.len(), 1);
        let body = &msgs[0].content;
        assert!(body.contains("create_component"));
        assert!(body.contains("Button"));
        assert!(body.contains("frontend, backend, devops"));
    }

    #[test]
    fn history_precedes_command() {
        let cmd = Command::new(CommandType::GenerateProject, Priority::High);
        let ctx = PromptContext::new()
            .with_history(vec![
                LlmMessage::user("earlier question"),
                LlmMessage::assistant("earlier answer"),
            ])
            .with_agents([AgentDomain::backend()])
            .with_instructions("use postgres");
        let msgs = build_planning_messages(&cmd, &ctx);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].role, LlmRole::Assistant);
        assert!(msgs[2].content.contains("Available agents: backend"));
        assert!(msgs[2].content.contains("use postgres"));
    }

    #[test]
    fn guidance_differs_by_category() {
        assert_ne!(
            task_template_guidance(CommandCategory::Frontend),
            task_template_guidance(CommandCategory::MultiAgent)
        );
        assert!(system_prompt().contains("executionStages"));
    }
}
