use std::path::Path;

use anyhow::Context;

use cn_core::command::validate_command_str;
use cn_core::config::Config;
use cn_core::plan_validator::validate_plan;
use cn_core::types::{Command, ExecutionPlan};

use super::read_file;

/// Parse and schema-check a command file.
pub fn load_command(path: &Path) -> anyhow::Result<Command> {
    let raw = read_file(path)?;
    validate_command_str(&raw).map_err(|violation| {
        let lines: Vec<String> = violation
            .violations
            .iter()
            .map(|v| format!("  {}: {}", v.field, v.message))
            .collect();
        anyhow::anyhow!("{} is not a valid command:\n{}", path.display(), lines.join("\n"))
    })
}

/// Parse a plan file and run the structural checks on it.
pub fn load_plan(path: &Path, config: &Config) -> anyhow::Result<ExecutionPlan> {
    let raw = read_file(path)?;
    let plan: ExecutionPlan = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not an execution plan", path.display()))?;
    validate_plan(&plan, &config.validation.options())
        .with_context(|| format!("{} failed structural validation", path.display()))?;
    Ok(plan)
}

pub fn command(path: &Path) -> anyhow::Result<()> {
    let cmd = load_command(path)?;
    println!(
        "ok: command `{}` ({}, priority {:?})",
        cmd.command_id, cmd.command_type, cmd.priority
    );
    Ok(())
}

pub fn plan(path: &Path, config: &Config) -> anyhow::Result<()> {
    let plan = load_plan(path, config)?;
    println!(
        "ok: plan `{}` with {} tasks in {} stages",
        plan.plan_id,
        plan.tasks.len(),
        plan.execution_stages.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn valid_command_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "cmd.json",
            r#"{"commandId": "c1", "commandType": "deploy_application", "payload": {"env": "staging"}, "priority": "high"}"#,
        );
        let cmd = load_command(&path).unwrap();
        assert_eq!(cmd.command_id, "c1");
    }

    #[test]
    fn invalid_command_lists_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cmd.json", r#"{"commandType": "teleport"}"#);
        let msg = load_command(&path).unwrap_err().to_string();
        assert!(msg.contains("commandId"));
        assert!(msg.contains("commandType"));
        assert!(msg.contains("payload"));
        assert!(msg.contains("priority"));
    }

    #[test]
    fn plan_with_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "plan.json",
            r#"{
              "planId": "p1", "commandId": "c1",
              "tasks": [
                {"taskId": "a", "agent": "backend", "action": "x", "dependencies": ["b"]},
                {"taskId": "b", "agent": "backend", "action": "y", "dependencies": ["a"]}
              ],
              "executionStages": [{"stageId": "s1", "parallelTasks": ["a", "b"]}],
              "estimatedTotalDuration": 0,
              "totalResourceRequirements": {"maxParallelTasks": 2, "totalCpuUnits": 2, "totalMemoryUnits": 1024},
              "metadata": {"createdAt": "2026-01-01T00:00:00Z", "complexity": "simple"}
            }"#,
        );
        let err = load_plan(&path, &Config::default()).unwrap_err();
        assert!(format!("{err:#}").contains("cyclic task dependency"));
    }
}
