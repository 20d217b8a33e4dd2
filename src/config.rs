//! Runtime settings.
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional TOML
//! file, then `FORECAST_PIPELINE_*` environment variables using `__` between
//! sections (`FORECAST_PIPELINE_PROVIDER__API_KEY=...`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::error::{PipelineError, Result};
use crate::models::Granularity;
use crate::utils::constants::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnits {
    #[default]
    Celsius,
    Kelvin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub provider: ProviderSettings,
    #[validate(nested)]
    pub storage: StorageSettings,
    #[validate(nested)]
    pub warehouse: WarehouseSettings,
    #[validate(nested)]
    pub transform: TransformSettings,
    #[validate(nested)]
    pub orchestrator: OrchestratorSettings,
    #[validate(nested)]
    pub state: StateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderSettings {
    #[validate(url)]
    pub base_url: String,
    pub api_key: Option<String>,
    pub locations: Vec<String>,
    pub units: TemperatureUnits,
    #[validate(range(min = 1, max = 24))]
    pub step_hours: u32,
    #[validate(range(min = 1, max = 500))]
    pub max_steps: u32,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
    #[validate(range(max = 10))]
    pub local_retries: u32,
    pub local_retry_delay_ms: u64,
    pub breaker_cooldown_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVIDER_URL.to_string(),
            api_key: None,
            locations: Vec::new(),
            units: TemperatureUnits::default(),
            step_hours: DEFAULT_STEP_HOURS,
            max_steps: DEFAULT_MAX_STEPS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            local_retries: DEFAULT_LOCAL_RETRIES,
            local_retry_delay_ms: DEFAULT_LOCAL_RETRY_DELAY_MS,
            breaker_cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory of the partition store.
    pub root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_DATA_DIR).join("lake"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WarehouseSettings {
    pub root: PathBuf,
    #[validate(length(min = 1))]
    pub table: String,
    #[validate(range(min = 1, max = 64))]
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub compression: String,
    #[validate(range(min = 1))]
    pub row_group_size: usize,
    #[validate(range(max = 10))]
    pub local_retries: u32,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_DATA_DIR).join("warehouse"),
            table: DEFAULT_WAREHOUSE_TABLE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout_ms: DEFAULT_POOL_ACQUIRE_TIMEOUT_MS,
            compression: COMPRESSION_SNAPPY.to_string(),
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            local_retries: DEFAULT_LOCAL_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransformSettings {
    /// Share of a batch allowed to carry non-coercible numeric values.
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_invalid_fraction: f64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            max_invalid_fraction: DEFAULT_MAX_INVALID_FRACTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub granularity: Granularity,
    #[validate(range(min = 1))]
    pub cadence_secs: u64,
    #[validate(range(min = 1, max = 256))]
    pub worker_concurrency: usize,
    #[validate(range(min = 1))]
    pub stage_timeout_secs: u64,
    #[validate(nested)]
    pub retry: RetrySettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            cadence_secs: DEFAULT_CADENCE_SECS,
            worker_concurrency: num_cpus::get(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetrySettings {
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StateSettings {
    pub path: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATA_DIR).join("state").join("partitions.json"),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("provider.locations"),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Extraction cannot run without a key and at least one location.
    pub fn require_credentials(&self) -> Result<()> {
        let has_key = self
            .provider
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key {
            return Err(PipelineError::Config(format!(
                "provider API key is not set (use provider.api_key or {ENV_PREFIX}_PROVIDER__API_KEY)"
            )));
        }
        if self.provider.locations.is_empty() {
            return Err(PipelineError::Config(
                "no provider locations configured (provider.locations)".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn local_retry_delay(&self) -> Duration {
        Duration::from_millis(self.local_retry_delay_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

impl WarehouseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl OrchestratorSettings {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.transform.max_invalid_fraction, 0.2);
        assert_eq!(settings.orchestrator.granularity, Granularity::Hourly);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[provider]
api_key = "secret"
locations = ["2643743", "2988507"]
units = "kelvin"

[orchestrator]
granularity = "daily"
worker_concurrency = 2

[orchestrator.retry]
max_attempts = 3
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.provider.locations.len(), 2);
        assert_eq!(settings.provider.units, TemperatureUnits::Kelvin);
        assert_eq!(settings.orchestrator.granularity, Granularity::Daily);
        assert_eq!(settings.orchestrator.retry.max_attempts, 3);
        assert_eq!(settings.warehouse.table, DEFAULT_WAREHOUSE_TABLE);
        assert!(settings.require_credentials().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[transform]\nmax_invalid_fraction = 1.5").unwrap();
        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_credentials_is_a_configuration_error() {
        let settings = Settings::default();
        let err = settings.require_credentials().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
