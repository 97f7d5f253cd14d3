use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a workflow definition (the first half of a snapshot key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a single step invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: Value },
    Suspended { payload: Value },
    Failed { error: String },
}

/// Recorded result of a step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Resume data the step was re-entered with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_with: Option<Value>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.outcome, StepOutcome::Suspended { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            StepOutcome::Success { output } => Some(output),
            _ => None,
        }
    }

    pub fn suspend_payload(&self) -> Option<&Value> {
        match &self.outcome {
            StepOutcome::Suspended { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            StepOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Branch bookkeeping for one in-flight stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProgress {
    pub completed: BTreeSet<StepId>,
    pub pending: BTreeSet<StepId>,
}

/// Stages that stopped short of completion, keyed by stage id
pub type ActivePaths = BTreeMap<String, BranchProgress>;

/// What `start` and `resume` hand back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub steps: BTreeMap<StepId, StepResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub active_paths: ActivePaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// Steps currently holding a `Suspended` result
    pub fn suspended_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|(_, r)| r.is_suspended())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(&StepId::new(step_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_result_serializes_flat() {
        let now = Utc::now();
        let result = StepResult {
            outcome: StepOutcome::Suspended {
                payload: json!({"suggestions": ["Bali"]}),
            },
            started_at: now,
            ended_at: now,
            resumed_with: None,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "suspended");
        assert_eq!(value["payload"]["suggestions"][0], "Bali");
        assert!(value.get("resumed_with").is_none());

        let back: StepResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert_eq!(RunStatus::Suspended.to_string(), "suspended");
    }
}
