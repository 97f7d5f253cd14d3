use crate::snapshot::{Snapshot, SnapshotError};
use crate::types::{RunId, WorkflowId};
use async_trait::async_trait;

/// Error type for snapshot store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be encoded or decoded as a snapshot
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub(crate) fn snapshot_key(workflow_id: &WorkflowId, run_id: &RunId) -> String {
    format!("{}/{}", workflow_id, run_id)
}

/// Persistent storage of run snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upsert the snapshot for `(workflow_id, run_id)`, overwriting any prior one.
    async fn save(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if nothing was saved under the key.
    async fn load(&self, workflow_id: &WorkflowId, run_id: &RunId)
        -> Result<Snapshot, StoreError>;

    async fn delete(&self, workflow_id: &WorkflowId, run_id: &RunId) -> Result<(), StoreError>;

    /// Run ids with a stored snapshot for `workflow_id`
    async fn list_runs(&self, workflow_id: &WorkflowId) -> Result<Vec<RunId>, StoreError>;
}
