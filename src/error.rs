use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure taxonomy shared by every pipeline component.
///
/// Only `TransientInfra` failures are ever retried by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, rate limiting, pool exhaustion, timeouts.
    TransientInfra,
    /// Provider data no longer matches the expected shape.
    SchemaViolation,
    /// Warehouse constraint or partial-write problem that needs an operator.
    IntegrityViolation,
    /// Missing credentials, permissions or invalid settings.
    ConfigurationError,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientInfra)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientInfra => "transient_infra",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags an error with its place in the taxonomy.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object store I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("failed to decode object '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io { .. } => ErrorKind::TransientInfra,
            StoreError::NotFound(_) | StoreError::InvalidKey(_) => ErrorKind::IntegrityViolation,
            StoreError::Codec { .. } => ErrorKind::SchemaViolation,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("provider unreachable: {0}")]
    Network(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider returned HTTP {status} for location {location}")]
    ProviderStatus { status: u16, location: String },

    #[error("provider circuit breaker open ({remaining_secs}s cooldown remaining)")]
    CircuitOpen { remaining_secs: u64 },

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("invalid provider endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no provider locations configured")]
    NoLocations,

    #[error("malformed payload for location {location}: {reason}")]
    MalformedPayload { location: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for ExtractError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Network(_)
            | ExtractError::RateLimited { .. }
            | ExtractError::ProviderStatus { .. }
            | ExtractError::CircuitOpen { .. } => ErrorKind::TransientInfra,
            ExtractError::Unauthorized(_)
            | ExtractError::InvalidEndpoint(_)
            | ExtractError::NoLocations => ErrorKind::ConfigurationError,
            ExtractError::MalformedPayload { .. } => ErrorKind::SchemaViolation,
            ExtractError::Store(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("no raw batch stored for partition {0}")]
    MissingRawBatch(String),

    #[error(
        "{affected} of {total} records ({:.1}%) have non-coercible numeric fields, \
         above the {:.1}% tolerance",
        .fraction * 100.0,
        .threshold * 100.0
    )]
    QualityThreshold {
        affected: usize,
        total: usize,
        fraction: f64,
        threshold: f64,
    },

    #[error("transform worker stopped: {0}")]
    Aborted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for TransformError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransformError::MissingRawBatch(_) => ErrorKind::IntegrityViolation,
            TransformError::Aborted(_) => ErrorKind::TransientInfra,
            TransformError::QualityThreshold { .. } => ErrorKind::SchemaViolation,
            TransformError::Store(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("warehouse unreachable: {0}")]
    Unreachable(String),

    #[error("warehouse connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("constraint violation in batch for partition {partition}: {reason}")]
    ConstraintViolation { partition: String, reason: String },

    #[error("partial write for partition {partition} could not be rolled back: {reason}")]
    PartialWrite { partition: String, reason: String },

    #[error("warehouse I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error on '{path}': {source}")]
    Parquet {
        path: String,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("unexpected warehouse column layout: {0}")]
    Schema(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for LoadError {
    fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Unreachable(_) | LoadError::PoolExhausted { .. } | LoadError::Io { .. } => {
                ErrorKind::TransientInfra
            }
            LoadError::ConstraintViolation { .. }
            | LoadError::PartialWrite { .. }
            | LoadError::Parquet { .. }
            | LoadError::Arrow(_)
            | LoadError::Schema(_) => ErrorKind::IntegrityViolation,
            LoadError::Store(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state table I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state table is corrupt: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("partition {0} is not tracked")]
    UnknownPartition(String),
}

/// Failure of a single stage invocation, as seen by the orchestrator.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Classify for StageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StageError::Extract(e) => e.kind(),
            StageError::Transform(e) => e.kind(),
            StageError::Load(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid partition key '{0}'")]
    InvalidPartitionKey(String),

    #[error("Partition {0} has an active run")]
    PartitionBusy(String),

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Worker pool closed")]
    Cancelled,

    #[error("Async task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_)
            | PipelineError::Settings(_)
            | PipelineError::Validation(_)
            | PipelineError::InvalidPartitionKey(_)
            | PipelineError::UnknownMetric(_) => ErrorKind::ConfigurationError,
            PipelineError::Json(_) | PipelineError::Csv(_) => ErrorKind::SchemaViolation,
            PipelineError::Extract(e) => e.kind(),
            PipelineError::Transform(e) => e.kind(),
            PipelineError::Load(e) => e.kind(),
            PipelineError::Store(e) => e.kind(),
            PipelineError::State(_) => ErrorKind::IntegrityViolation,
            PipelineError::Io(_)
            | PipelineError::PartitionBusy(_)
            | PipelineError::Cancelled
            | PipelineError::TaskJoin(_) => ErrorKind::TransientInfra,
        }
    }
}
