use serde::{Deserialize, Serialize};

use crate::models::{ForecastRecord, PartitionKey};

/// A forecast record as stored in the warehouse table.
///
/// `partition_key` drives replace-on-reload: a partition's rows are always
/// swapped out as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub partition_key: String,
    #[serde(flatten)]
    pub record: ForecastRecord,
}

impl WarehouseRow {
    pub fn new(partition_key: &PartitionKey, record: ForecastRecord) -> Self {
        Self {
            partition_key: partition_key.to_string(),
            record,
        }
    }
}
