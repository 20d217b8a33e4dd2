pub mod coercion;
pub mod engine;
pub mod report;
pub mod schema_map;

pub use engine::{transform_records, TransformConfig, TransformEngine, TransformedBatch};
pub use report::TransformReport;
