use super::backend::{snapshot_key, SnapshotStore, StoreError};
use crate::snapshot::Snapshot;
use crate::types::{RunId, WorkflowId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Keeps snapshots encoded, so loads go through the same versioned decoding
/// as a durable backend
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<String, (WorkflowId, RunId, Vec<u8>)>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded snapshot exactly as stored
    pub fn raw(&self, workflow_id: &WorkflowId, run_id: &RunId) -> Option<Vec<u8>> {
        self.snapshots
            .read()
            .ok()?
            .get(&snapshot_key(workflow_id, run_id))
            .map(|(_, _, bytes)| bytes.clone())
    }
}

fn lock_error<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(format!("Lock error: {}", e))
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        let bytes = snapshot.to_bytes()?;
        let mut snapshots = self.snapshots.write().map_err(lock_error)?;
        snapshots.insert(
            snapshot_key(workflow_id, run_id),
            (workflow_id.clone(), *run_id, bytes),
        );
        Ok(())
    }

    async fn load(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<Snapshot, StoreError> {
        let key = snapshot_key(workflow_id, run_id);
        let bytes = {
            let snapshots = self.snapshots.read().map_err(lock_error)?;
            snapshots
                .get(&key)
                .map(|(_, _, bytes)| bytes.clone())
                .ok_or(StoreError::NotFound(key))?
        };
        Ok(Snapshot::from_bytes(&bytes)?)
    }

    async fn delete(&self, workflow_id: &WorkflowId, run_id: &RunId) -> Result<(), StoreError> {
        let key = snapshot_key(workflow_id, run_id);
        let mut snapshots = self.snapshots.write().map_err(lock_error)?;
        snapshots
            .remove(&key)
            .map(|_| ())
            .ok_or(StoreError::NotFound(key))
    }

    async fn list_runs(&self, workflow_id: &WorkflowId) -> Result<Vec<RunId>, StoreError> {
        let snapshots = self.snapshots.read().map_err(lock_error)?;
        let mut runs: Vec<RunId> = snapshots
            .values()
            .filter(|(wf, _, _)| wf == workflow_id)
            .map(|(_, run_id, _)| *run_id)
            .collect();
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SNAPSHOT_VERSION;
    use crate::types::RunStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(workflow_id: &WorkflowId, run_id: RunId, status: RunStatus) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            workflow_id: workflow_id.clone(),
            run_id,
            definition_hash: "hash".to_string(),
            status,
            trigger_input: json!({"n": 1}),
            steps: BTreeMap::new(),
            active_paths: BTreeMap::new(),
            result: None,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_upsert_and_load() {
        let store = InMemorySnapshotStore::new();
        let wf = WorkflowId::new("wf");
        let run_id = RunId::new();

        let err = store.load(&wf, &run_id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        store
            .save(&wf, &run_id, &snapshot(&wf, run_id, RunStatus::Suspended))
            .await
            .unwrap();
        store
            .save(&wf, &run_id, &snapshot(&wf, run_id, RunStatus::Success))
            .await
            .unwrap();

        let loaded = store.load(&wf, &run_id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(store.list_runs(&wf).await.unwrap(), vec![run_id]);
        assert!(store.list_runs(&WorkflowId::new("other")).await.unwrap().is_empty());

        // Same run id under another workflow is a different key
        assert!(store.load(&WorkflowId::new("other"), &run_id).await.is_err());

        store.delete(&wf, &run_id).await.unwrap();
        assert!(store.raw(&wf, &run_id).is_none());
    }
}
