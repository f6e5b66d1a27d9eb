//! Quality gate evaluation.
//!
//! The scheduler decides *when* gates run; an external
//! [`QualityGateEvaluator`] decides whether each one passes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use cn_core::types::{ExecutionPlan, ExecutionStatus, GateResult, QualityGate};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("gate evaluator failed: {0}")]
    Evaluator(String),
}

/// Verdict for one gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub passed: bool,
    pub message: String,
}

impl GateOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }

    pub fn into_result(self, gate: &QualityGate) -> GateResult {
        GateResult {
            gate_id: gate.gate_id.clone(),
            trigger: gate.trigger,
            required: gate.required,
            passed: self.passed,
            message: self.message,
        }
    }
}

#[async_trait]
pub trait QualityGateEvaluator: Send + Sync {
    /// `status` is a snapshot taken just before the gate runs.
    async fn evaluate(
        &self,
        gate: &QualityGate,
        plan: &ExecutionPlan,
        status: &ExecutionStatus,
    ) -> Result<GateOutcome, GateError>;
}

// ---------------------------------------------------------------------------
// PassAllGates
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct PassAllGates;

#[async_trait]
impl QualityGateEvaluator for PassAllGates {
    async fn evaluate(
        &self,
        gate: &QualityGate,
        _plan: &ExecutionPlan,
        _status: &ExecutionStatus,
    ) -> Result<GateOutcome, GateError> {
        Ok(GateOutcome::pass(format!("{} passed", gate.name)))
    }
}

// ---------------------------------------------------------------------------
// StaticGateEvaluator
// ---------------------------------------------------------------------------

/// Scripted outcomes by gate id; unscripted gates pass. Remembers the order
/// gates were evaluated in.
#[derive(Debug, Default)]
pub struct StaticGateEvaluator {
    outcomes: HashMap<String, Result<bool, String>>,
    evaluated: Mutex<Vec<String>>,
}

impl StaticGateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, gate_id: impl Into<String>) -> Self {
        self.outcomes.insert(gate_id.into(), Ok(false));
        self
    }

    pub fn passing(mut self, gate_id: impl Into<String>) -> Self {
        self.outcomes.insert(gate_id.into(), Ok(true));
        self
    }

    /// The evaluator itself errors for this gate.
    pub fn erroring(mut self, gate_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.outcomes.insert(gate_id.into(), Err(message.into()));
        self
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.lock().expect("gate evaluator lock poisoned").clone()
    }
}

#[async_trait]
impl QualityGateEvaluator for StaticGateEvaluator {
    async fn evaluate(
        &self,
        gate: &QualityGate,
        _plan: &ExecutionPlan,
        _status: &ExecutionStatus,
    ) -> Result<GateOutcome, GateError> {
        self.evaluated
            .lock()
            .expect("gate evaluator lock poisoned")
            .push(gate.gate_id.clone());
        match self.outcomes.get(&gate.gate_id) {
            Some(Ok(false)) => Ok(GateOutcome::fail(format!("{} failed", gate.name))),
            Some(Err(msg)) => Err(GateError::Evaluator(msg.clone())),
            Some(Ok(true)) | None => Ok(GateOutcome::pass(format!("{} passed", gate.name))),
        }
    }
}

// ---------------------------------------------------------------------------
// ThresholdGateEvaluator
// ---------------------------------------------------------------------------

/// Checks a gate's numeric thresholds against the live status.
///
/// Understood keys: `maxFailedTasks`, `minCompletionRatio` (0.0..=1.0) and
/// `maxWarnings`. Other keys are ignored; a gate without thresholds passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdGateEvaluator;

#[async_trait]
impl QualityGateEvaluator for ThresholdGateEvaluator {
    async fn evaluate(
        &self,
        gate: &QualityGate,
        _plan: &ExecutionPlan,
        status: &ExecutionStatus,
    ) -> Result<GateOutcome, GateError> {
        let Some(thresholds) = &gate.thresholds else {
            return Ok(GateOutcome::pass("no thresholds"));
        };

        let mut breaches = Vec::new();
        for (key, limit) in thresholds {
            match key.as_str() {
                "maxFailedTasks" if status.failed_tasks as f64 > *limit => {
                    breaches.push(format!("{} failed tasks > {limit}", status.failed_tasks));
                }
                "maxWarnings" if status.warnings.len() as f64 > *limit => {
                    breaches.push(format!("{} warnings > {limit}", status.warnings.len()));
                }
                "minCompletionRatio" => {
                    let ratio = if status.total_tasks == 0 {
                        1.0
                    } else {
                        status.completed_tasks as f64 / status.total_tasks as f64
                    };
                    if ratio < *limit {
                        breaches.push(format!("completion {ratio:.2} < {limit}"));
                    }
                }
                _ => {}
            }
        }

        if breaches.is_empty() {
            Ok(GateOutcome::pass(format!("{} within thresholds", gate.name)))
        } else {
            Ok(GateOutcome::fail(format!("{}: {}", gate.name, breaches.join("; "))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_core::types::{AgentDomain, ExecutionStage, GateTrigger, Task, TaskStatus};
    use std::collections::BTreeMap;

    fn plan_with_gate(gate: QualityGate) -> ExecutionPlan {
        ExecutionPlan::assemble(
            "cmd-1",
            vec![
                Task::new("t1", AgentDomain::backend(), "create_api"),
                Task::new("t2", AgentDomain::backend(), "create_model"),
            ],
            vec![ExecutionStage::new("s1", vec!["t1".into(), "t2".into()])],
            vec![gate],
        )
    }

    #[tokio::test]
    async fn static_evaluator_scripts_and_records() {
        let gate = QualityGate::new("lint", GateTrigger::BeforeDeploy, true);
        let plan = plan_with_gate(gate.clone());
        let status = ExecutionStatus::for_plan(&plan);
        let eval = StaticGateEvaluator::new().failing("lint");

        let outcome = eval.evaluate(&gate, &plan, &status).await.unwrap();
        assert!(!outcome.passed);
        let other = QualityGate::new("tests", GateTrigger::BeforeStart, false);
        assert!(eval.evaluate(&other, &plan, &status).await.unwrap().passed);
        assert_eq!(eval.evaluated(), vec!["lint".to_string(), "tests".to_string()]);

        let result = outcome.into_result(&gate);
        assert_eq!(result.gate_id, "lint");
        assert!(result.required);
    }

    #[tokio::test]
    async fn thresholds_compare_against_status() {
        let mut gate = QualityGate::new("health", GateTrigger::AfterCompletion, true);
        gate.thresholds = Some(BTreeMap::from([
            ("maxFailedTasks".to_string(), 0.0),
            ("minCompletionRatio".to_string(), 0.5),
        ]));
        let plan = plan_with_gate(gate.clone());
        let mut status = ExecutionStatus::for_plan(&plan);
        status.task_mut("t1").unwrap().status = TaskStatus::Completed;
        status.recompute();
        assert!(ThresholdGateEvaluator.evaluate(&gate, &plan, &status).await.unwrap().passed);

        status.task_mut("t2").unwrap().status = TaskStatus::Failed;
        status.recompute();
        let outcome = ThresholdGateEvaluator.evaluate(&gate, &plan, &status).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.message.contains("failed tasks"));
    }
}
