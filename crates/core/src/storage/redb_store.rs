use super::backend::{snapshot_key, SnapshotStore, StoreError};
use crate::snapshot::Snapshot;
use crate::types::{RunId, WorkflowId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Snapshot store backed by an embedded redb database; survives restarts
#[derive(Clone)]
pub struct RedbSnapshotStore {
    db: Arc<Database>,
}

impl RedbSnapshotStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _snapshots_table = write_txn
                .open_table(SNAPSHOTS_TABLE)
                .context("Failed to open snapshots table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(SNAPSHOTS_TABLE)
                .context("Failed to open table")?;
            table.insert(key, value).context("Failed to insert snapshot")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(SNAPSHOTS_TABLE)
            .context("Failed to open table")?;
        let value = table.get(key).context("Failed to get snapshot")?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn remove_raw(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(SNAPSHOTS_TABLE)
                .context("Failed to open table")?;
            let removed = table.remove(key).context("Failed to remove snapshot")?;
            removed.is_some()
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(SNAPSHOTS_TABLE)
            .context("Failed to open table")?;

        let mut keys = Vec::new();
        for item in table.iter().context("Failed to iterate snapshots")? {
            let (key, _value) = item.context("Failed to read item")?;
            if key.value().starts_with(prefix) {
                keys.push(key.value().to_string());
            }
        }
        Ok(keys)
    }
}

fn backend_error(e: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{:#}", e))
}

#[async_trait]
impl SnapshotStore for RedbSnapshotStore {
    async fn save(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        let bytes = snapshot.to_bytes()?;
        self.put_raw(&snapshot_key(workflow_id, run_id), &bytes)
            .map_err(backend_error)
    }

    async fn load(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<Snapshot, StoreError> {
        let key = snapshot_key(workflow_id, run_id);
        let bytes = self
            .get_raw(&key)
            .map_err(backend_error)?
            .ok_or(StoreError::NotFound(key))?;
        Ok(Snapshot::from_bytes(&bytes)?)
    }

    async fn delete(&self, workflow_id: &WorkflowId, run_id: &RunId) -> Result<(), StoreError> {
        let key = snapshot_key(workflow_id, run_id);
        if self.remove_raw(&key).map_err(backend_error)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(key))
        }
    }

    async fn list_runs(&self, workflow_id: &WorkflowId) -> Result<Vec<RunId>, StoreError> {
        let prefix = format!("{}/", workflow_id);
        let keys = self.keys_with_prefix(&prefix).map_err(backend_error)?;

        // Keys of workflows nested under this id ("x/y/<run>") share the prefix
        let mut runs = keys
            .iter()
            .map(|key| &key[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(|rest| {
                RunId::parse(rest).map_err(|e| {
                    StoreError::Serialization(format!("Bad key '{}{}': {}", prefix, rest, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        runs.sort();
        Ok(runs)
    }
}
