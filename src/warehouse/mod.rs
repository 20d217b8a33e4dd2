pub mod loader;
pub mod parquet_table;
pub mod pool;
pub mod table;

pub use loader::{validate_batch, LoadResult, Loader, LoaderConfig};
pub use parquet_table::{ParquetFileInfo, ParquetTable};
pub use pool::{ConnectionPool, PooledConnection};
pub use table::{ParquetWarehouse, ReplaceOutcome, Warehouse};
