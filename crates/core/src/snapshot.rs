use crate::types::{ActivePaths, RunId, RunResult, RunStatus, StepId, StepResult, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version written into every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Unsupported snapshot version {found} (this build reads up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Snapshot is inconsistent with its workflow: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    /// Hash of the graph shape the run was started on
    pub definition_hash: String,
    pub status: RunStatus,
    pub trigger_input: Value,
    pub steps: BTreeMap<StepId, StepResult>,
    #[serde(default)]
    pub active_paths: ActivePaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u32>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a snapshot, refusing shapes this build does not understand
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        let found = probe.version.unwrap_or(0);
        if found == 0 || found > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Suspended
    }

    pub fn into_run_result(self) -> RunResult {
        RunResult {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            status: self.status,
            steps: self.steps,
            active_paths: self.active_paths,
            output: self.result,
            error: self.error,
        }
    }
}
