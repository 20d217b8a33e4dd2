/// Partition store stage prefixes
pub const RAW_STAGE: &str = "raw";
pub const TRANSFORMED_STAGE: &str = "transformed";

/// Partition store file names
pub const RAW_MANIFEST_FILE: &str = "_manifest.json";
pub const TRANSFORMED_FILE: &str = "forecast.jsonl";
pub const TRANSFORM_REPORT_FILE: &str = "_report.json";

/// Warehouse defaults
pub const DEFAULT_WAREHOUSE_TABLE: &str = "forecast_hourly";
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10000;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
pub const PARTITION_FILE_PREFIX: &str = "partition_key=";
pub const PARQUET_EXTENSION: &str = ".parquet";
pub const STAGING_EXTENSION: &str = ".parquet.staging";

/// Transform defaults
pub const DEFAULT_MAX_INVALID_FRACTION: f64 = 0.2;

/// Provider defaults
pub const DEFAULT_PROVIDER_URL: &str = "https://api.openweathermap.org/data/2.5";
pub const DEFAULT_STEP_HOURS: u32 = 3;
pub const DEFAULT_MAX_STEPS: u32 = 40;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCAL_RETRIES: u32 = 2;
pub const DEFAULT_LOCAL_RETRY_DELAY_MS: u64 = 250;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 300;
pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;
pub const KELVIN_OFFSET: f64 = 273.15;

/// Orchestrator defaults
pub const DEFAULT_CADENCE_SECS: u64 = 3600;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const MAX_ATTEMPT_HISTORY: usize = 100;

/// Configuration
pub const ENV_PREFIX: &str = "FORECAST_PIPELINE";
pub const DEFAULT_DATA_DIR: &str = "data";

/// Parquet compression options
pub const COMPRESSION_SNAPPY: &str = "snappy";
pub const COMPRESSION_GZIP: &str = "gzip";
pub const COMPRESSION_LZ4: &str = "lz4";
pub const COMPRESSION_ZSTD: &str = "zstd";
pub const COMPRESSION_NONE: &str = "none";
