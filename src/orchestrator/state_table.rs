use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StateError;
use crate::models::{PartitionKey, PartitionRecord, PartitionStatus};
use crate::utils::write_atomic;

const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    partitions: Vec<PartitionRecord>,
}

/// Persisted partition bookkeeping. Only the orchestrator writes to it.
///
/// Every mutation rewrites the backing file atomically before returning. A
/// mutation whose write fails leaves the in-memory table as it was.
#[derive(Debug)]
pub struct StateTable {
    path: Option<PathBuf>,
    rows: Mutex<BTreeMap<PartitionKey, PartitionRecord>>,
}

fn io_error(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_records(path: &Path) -> Result<Vec<PartitionRecord>, StateError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let file: StateFile = serde_json::from_slice(&bytes)?;
            Ok(file.partitions)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_error(path, e)),
    }
}

impl StateTable {
    /// Persisted records as they are on disk. Nothing is recovered or written,
    /// so this is safe while another process owns the table.
    pub async fn snapshot(path: &Path) -> Result<Vec<PartitionRecord>, StateError> {
        let mut records = read_records(path).await?;
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Open (or create) the table at `path`, reverting runs interrupted mid-stage.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let mut rows: BTreeMap<PartitionKey, PartitionRecord> = read_records(&path)
            .await?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();

        let mut recovered = 0usize;
        for record in rows.values_mut() {
            let interrupted = record.status;
            if record.recover_interrupted() {
                warn!(
                    partition = %record.key,
                    from = %interrupted,
                    to = %record.status,
                    "reverted interrupted partition run"
                );
                recovered += 1;
            }
        }

        let table = Self {
            path: Some(path),
            rows: Mutex::new(rows),
        };
        if recovered > 0 {
            let rows = table.rows.lock().await;
            table.persist(&rows).await?;
        }
        info!(partitions = table.rows.lock().await.len(), recovered, "state table opened");
        Ok(table)
    }

    /// A table that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, rows: &BTreeMap<PartitionKey, PartitionRecord>) -> Result<(), StateError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let file = StateFile {
            version: STATE_FORMAT_VERSION,
            partitions: rows.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| io_error(&path, std::io::Error::other(e)))?
            .map_err(|e| io_error(&path, e))
    }

    pub async fn get(&self, key: &PartitionKey) -> Option<PartitionRecord> {
        self.rows.lock().await.get(key).cloned()
    }

    /// Fetch a record, creating it as `Pending` if unknown. The flag is true on creation.
    pub async fn get_or_insert(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
    ) -> Result<(PartitionRecord, bool), StateError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(key) {
            return Ok((existing.clone(), false));
        }
        let record = PartitionRecord::new(key.clone(), now);
        let mut next = rows.clone();
        next.insert(key.clone(), record.clone());
        self.persist(&next).await?;
        *rows = next;
        Ok((record, true))
    }

    /// Apply `f` to a record and persist. Returns the updated record and `f`'s output.
    pub async fn update<T, F>(
        &self,
        key: &PartitionKey,
        f: F,
    ) -> Result<(PartitionRecord, T), StateError>
    where
        F: FnOnce(&mut PartitionRecord) -> T,
    {
        let mut rows = self.rows.lock().await;
        let mut record = rows
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::UnknownPartition(key.to_string()))?;
        let output = f(&mut record);

        let mut next = rows.clone();
        next.insert(key.clone(), record.clone());
        self.persist(&next).await?;
        *rows = next;
        Ok((record, output))
    }

    pub async fn remove(&self, key: &PartitionKey) -> Result<Option<PartitionRecord>, StateError> {
        let mut rows = self.rows.lock().await;
        if !rows.contains_key(key) {
            return Ok(None);
        }
        let mut next = rows.clone();
        let removed = next.remove(key);
        self.persist(&next).await?;
        *rows = next;
        Ok(removed)
    }

    /// All records in key order.
    pub async fn list(&self) -> Vec<PartitionRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Keys that still have work to do: neither loaded nor parked as failed.
    pub async fn pending(&self) -> Vec<PartitionKey> {
        self.rows
            .lock()
            .await
            .values()
            .filter(|r| !matches!(r.status, PartitionStatus::Loaded | PartitionStatus::Failed))
            .map(|r| r.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let key = PartitionKey::parse("2024-06-01T10").unwrap();

        {
            let table = StateTable::open(&path).await.unwrap();
            let (_, created) = table.get_or_insert(&key, Utc::now()).await.unwrap();
            assert!(created);
            table
                .update(&key, |r| {
                    r.begin_stage(Stage::Extract, Utc::now());
                    r.complete_stage(Stage::Extract, 12, Utc::now(), Utc::now());
                })
                .await
                .unwrap();
        }

        let reopened = StateTable::open(&path).await.unwrap();
        let record = reopened.get(&key).await.unwrap();
        assert_eq!(record.status, PartitionStatus::Extracted);
        assert_eq!(record.record_count, 12);
        assert_eq!(reopened.pending().await, vec![key]);
    }

    #[tokio::test]
    async fn test_interrupted_stage_reverts_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let key = PartitionKey::parse("2024-06-01").unwrap();

        {
            let table = StateTable::open(&path).await.unwrap();
            table.get_or_insert(&key, Utc::now()).await.unwrap();
            table
                .update(&key, |r| {
                    r.begin_stage(Stage::Extract, Utc::now());
                    r.complete_stage(Stage::Extract, 3, Utc::now(), Utc::now());
                    r.begin_stage(Stage::Transform, Utc::now());
                })
                .await
                .unwrap();
        }

        let reopened = StateTable::open(&path).await.unwrap();
        let record = reopened.get(&key).await.unwrap();
        assert_eq!(record.status, PartitionStatus::Extracted);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.attempt_stage, Some(Stage::Transform));
    }

    #[tokio::test]
    async fn test_snapshot_does_not_recover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let key = PartitionKey::parse("2024-06-01").unwrap();
        {
            let table = StateTable::open(&path).await.unwrap();
            table.get_or_insert(&key, Utc::now()).await.unwrap();
            table
                .update(&key, |r| r.begin_stage(Stage::Extract, Utc::now()))
                .await
                .unwrap();
        }

        let records = StateTable::snapshot(&path).await.unwrap();
        assert_eq!(records[0].status, PartitionStatus::Extracting);
        assert!(StateTable::snapshot(&dir.path().join("missing.json"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_partition_fails() {
        let table = StateTable::in_memory();
        let key = PartitionKey::parse("2024-06-01").unwrap();
        let err = table.update(&key, |_| ()).await.unwrap_err();
        assert!(matches!(err, StateError::UnknownPartition(_)));
        assert!(table.remove(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let path = state_dir.join("partitions.json");
        let key = PartitionKey::parse("2024-06-01").unwrap();
        let other = PartitionKey::parse("2024-06-02").unwrap();

        let table = StateTable::open(&path).await.unwrap();
        table.get_or_insert(&key, Utc::now()).await.unwrap();

        // A plain file where the state directory should be makes every write fail
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        let err = table
            .update(&key, |r| r.begin_stage(Stage::Extract, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
        let record = table.get(&key).await.unwrap();
        assert_eq!(record.status, PartitionStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.total_attempts, 0);

        assert!(table.get_or_insert(&other, Utc::now()).await.is_err());
        assert!(table.get(&other).await.is_none());

        assert!(table.remove(&key).await.is_err());
        assert_eq!(table.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            StateTable::open(&path).await,
            Err(StateError::Codec(_))
        ));
    }
}
