pub mod forecast;
pub mod partition;
pub mod warehouse;

pub use forecast::{ForecastRecord, Metric, RawRecord};
pub use partition::{
    AttemptOutcome, AttemptRecord, Granularity, PartitionKey, PartitionRecord, PartitionStatus,
    Stage, StageFailure, TimeWindow,
};
pub use warehouse::WarehouseRow;
