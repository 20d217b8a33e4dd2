use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::pool::ConnectionPool;
use super::table::Warehouse;
use crate::config::WarehouseSettings;
use crate::error::LoadError;
use crate::models::{ForecastRecord, PartitionKey, WarehouseRow};
use crate::store::PartitionStore;
use crate::utils::constants::DEFAULT_LOCAL_RETRY_DELAY_MS;
use crate::utils::with_local_retries;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub local_retries: u32,
    pub local_retry_delay: Duration,
}

impl From<&WarehouseSettings> for LoaderConfig {
    fn from(settings: &WarehouseSettings) -> Self {
        Self {
            local_retries: settings.local_retries,
            local_retry_delay: Duration::from_millis(DEFAULT_LOCAL_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub partition_key: PartitionKey,
    pub rows_written: usize,
    pub replaced_rows: usize,
    pub rolled_back_partial: bool,
}

/// Writes transformed batches into the warehouse, one whole partition at a time.
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    pool: ConnectionPool,
    store: PartitionStore,
    config: LoaderConfig,
}

/// Check the constraints the warehouse table relies on.
pub fn validate_batch(key: &PartitionKey, rows: &[WarehouseRow]) -> Result<(), LoadError> {
    let expected = key.to_string();
    let violation = |reason: String| LoadError::ConstraintViolation {
        partition: expected.clone(),
        reason,
    };

    let mut seen = HashSet::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.partition_key != expected {
            return Err(violation(format!(
                "row {i} belongs to partition {}",
                row.partition_key
            )));
        }
        if row.record.location_id.trim().is_empty() {
            return Err(violation(format!("row {i} has an empty location id")));
        }
        if !row.record.has_finite_numerics() {
            return Err(violation(format!("row {i} has a non-finite numeric value")));
        }
        if !seen.insert((row.record.location_id.as_str(), row.record.forecast_time)) {
            return Err(violation(format!(
                "duplicate row for location {} at {}",
                row.record.location_id, row.record.forecast_time
            )));
        }
    }
    Ok(())
}

impl Loader {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        pool: ConnectionPool,
        store: PartitionStore,
        config: LoaderConfig,
    ) -> Self {
        Self {
            warehouse,
            pool,
            store,
            config,
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Replace the partition with `batch`. Loading the same batch again is a no-op
    /// in effect: the partition ends up holding exactly these rows.
    pub async fn load(
        &self,
        key: &PartitionKey,
        batch: &[ForecastRecord],
    ) -> Result<LoadResult, LoadError> {
        let rows: Vec<WarehouseRow> = batch
            .iter()
            .cloned()
            .map(|record| WarehouseRow::new(key, record))
            .collect();
        validate_batch(key, &rows)?;

        let outcome = with_local_retries(
            "warehouse replace",
            self.config.local_retries,
            self.config.local_retry_delay,
            || async {
                let connection = self.pool.acquire().await?;
                let outcome = self.warehouse.replace_partition(key, rows.clone()).await;
                debug!(partition = %key, held_ms = connection.held_for().as_millis() as u64, "connection released");
                outcome
            },
        )
        .await?;

        info!(
            partition = %key,
            table = self.warehouse.table(),
            rows = outcome.rows_written,
            replaced = outcome.replaced_rows,
            rolled_back = outcome.rolled_back_partial,
            "partition loaded"
        );

        Ok(LoadResult {
            partition_key: key.clone(),
            rows_written: outcome.rows_written,
            replaced_rows: outcome.replaced_rows,
            rolled_back_partial: outcome.rolled_back_partial,
        })
    }

    /// Load the transformed artifact persisted for `key`.
    pub async fn load_from_store(&self, key: &PartitionKey) -> Result<LoadResult, LoadError> {
        let rows = self.store.read_transformed(key).await?;
        self.load(key, &rows).await
    }

    /// Drop the partition from the warehouse.
    pub async fn purge(&self, key: &PartitionKey) -> Result<usize, LoadError> {
        let _connection = self.pool.acquire().await?;
        self.warehouse.delete_partition(key).await
    }
}
