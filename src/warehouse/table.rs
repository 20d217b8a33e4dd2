use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::{debug, warn};

use super::parquet_table::{ParquetFileInfo, ParquetTable};
use crate::error::LoadError;
use crate::models::{PartitionKey, WarehouseRow};
use crate::utils::constants::{PARQUET_EXTENSION, PARTITION_FILE_PREFIX, STAGING_EXTENSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub rows_written: usize,
    /// Rows the partition held before the replace.
    pub replaced_rows: usize,
    /// An interrupted earlier replace was found and discarded first.
    pub rolled_back_partial: bool,
}

/// Warehouse table partitioned by `partition_key`.
///
/// `replace_partition` is all-or-nothing: readers see either the previous rows
/// of the partition or the new ones.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn table(&self) -> &str;

    async fn replace_partition(
        &self,
        key: &PartitionKey,
        rows: Vec<WarehouseRow>,
    ) -> Result<ReplaceOutcome, LoadError>;

    /// Remove a partition. Returns the number of rows removed.
    async fn delete_partition(&self, key: &PartitionKey) -> Result<usize, LoadError>;

    /// Rows of a partition; empty when it was never loaded.
    async fn read_partition(&self, key: &PartitionKey) -> Result<Vec<WarehouseRow>, LoadError>;

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LoadError>;
}

fn io_error(path: &Path, source: std::io::Error) -> LoadError {
    LoadError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn blocking<T, F>(f: F) -> Result<T, LoadError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LoadError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LoadError::Unreachable(format!("warehouse worker stopped: {e}")))?
}

/// One Parquet file per partition under `{root}/{table}/`.
#[derive(Debug, Clone)]
pub struct ParquetWarehouse {
    table: String,
    dir: PathBuf,
    codec: ParquetTable,
}

impl ParquetWarehouse {
    pub fn new(root: impl AsRef<Path>, table: impl Into<String>, codec: ParquetTable) -> Self {
        let table = table.into();
        Self {
            dir: root.as_ref().join(&table),
            table,
            codec,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.dir
            .join(format!("{PARTITION_FILE_PREFIX}{key}{PARQUET_EXTENSION}"))
    }

    /// Every staging file of `key` starts with this. Each replace adds its own
    /// random suffix, so a stale writer never shares a file with a newer one.
    pub fn staging_prefix(&self, key: &PartitionKey) -> String {
        format!("{PARTITION_FILE_PREFIX}{key}.")
    }

    fn staging_files(&self, key: &PartitionKey) -> Result<Vec<PathBuf>, LoadError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = self.staging_prefix(key);
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(STAGING_EXTENSION) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn file_info(&self, key: &PartitionKey) -> Result<Option<ParquetFileInfo>, LoadError> {
        let path = self.partition_path(key);
        if path.exists() {
            self.codec.file_info(&path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Remove staging files left behind by interrupted replaces.
    pub fn recover_staging(&self) -> Result<Vec<String>, LoadError> {
        let mut recovered = Vec::new();
        if !self.dir.is_dir() {
            return Ok(recovered);
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = name
                .strip_prefix(PARTITION_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(STAGING_EXTENSION))
                .and_then(|rest| rest.split('.').next());
            if let Some(key) = key {
                std::fs::remove_file(entry.path()).map_err(|e| io_error(&entry.path(), e))?;
                warn!(table = %self.table, partition = key, "removed interrupted partition write");
                recovered.push(key.to_string());
            }
        }
        recovered.sort();
        recovered.dedup();
        Ok(recovered)
    }

    fn replace_blocking(
        &self,
        key: &PartitionKey,
        rows: &[WarehouseRow],
    ) -> Result<ReplaceOutcome, LoadError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let live = self.partition_path(key);

        let leftovers = self.staging_files(key)?;
        let rolled_back_partial = !leftovers.is_empty();
        for leftover in &leftovers {
            std::fs::remove_file(leftover).map_err(|e| LoadError::PartialWrite {
                partition: key.to_string(),
                reason: format!("cannot remove {}: {e}", leftover.display()),
            })?;
        }
        if rolled_back_partial {
            warn!(
                table = %self.table,
                partition = %key,
                discarded = leftovers.len(),
                "rolled back partial write, performing full replace"
            );
        }

        let replaced_rows = if live.exists() {
            let info = self.codec.file_info(&live)?;
            usize::try_from(info.total_rows).unwrap_or(0)
        } else {
            0
        };

        // Removed on drop unless persisted
        let staging = Builder::new()
            .prefix(&self.staging_prefix(key))
            .suffix(STAGING_EXTENSION)
            .tempfile_in(&self.dir)
            .map_err(|e| io_error(&self.dir, e))?;
        self.codec.write_rows(rows, staging.path())?;
        staging
            .persist(&live)
            .map_err(|e| io_error(&live, e.error))?;

        debug!(
            table = %self.table,
            partition = %key,
            rows = rows.len(),
            replaced_rows,
            "partition replaced"
        );
        Ok(ReplaceOutcome {
            rows_written: rows.len(),
            replaced_rows,
            rolled_back_partial,
        })
    }

    fn delete_blocking(&self, key: &PartitionKey) -> Result<usize, LoadError> {
        let live = self.partition_path(key);
        let removed = if live.exists() {
            let rows = self.codec.file_info(&live)?.total_rows;
            std::fs::remove_file(&live).map_err(|e| io_error(&live, e))?;
            usize::try_from(rows).unwrap_or(0)
        } else {
            0
        };
        for staging in self.staging_files(key)? {
            std::fs::remove_file(&staging).map_err(|e| io_error(&staging, e))?;
        }
        Ok(removed)
    }

    fn partitions_blocking(&self) -> Result<Vec<PartitionKey>, LoadError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let parsed = name
                .strip_prefix(PARTITION_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(PARQUET_EXTENSION))
                .and_then(|key| PartitionKey::parse(key).ok());
            if let Some(key) = parsed {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl Warehouse for ParquetWarehouse {
    fn table(&self) -> &str {
        &self.table
    }

    async fn replace_partition(
        &self,
        key: &PartitionKey,
        rows: Vec<WarehouseRow>,
    ) -> Result<ReplaceOutcome, LoadError> {
        let this = self.clone();
        let key = key.clone();
        blocking(move || this.replace_blocking(&key, &rows)).await
    }

    async fn delete_partition(&self, key: &PartitionKey) -> Result<usize, LoadError> {
        let this = self.clone();
        let key = key.clone();
        blocking(move || this.delete_blocking(&key)).await
    }

    async fn read_partition(&self, key: &PartitionKey) -> Result<Vec<WarehouseRow>, LoadError> {
        let path = self.partition_path(key);
        blocking(move || {
            if path.exists() {
                ParquetTable::read_rows(&path)
            } else {
                Ok(Vec::new())
            }
        })
        .await
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LoadError> {
        let this = self.clone();
        blocking(move || this.partitions_blocking()).await
    }
}
