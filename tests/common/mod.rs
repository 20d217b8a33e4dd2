#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use forecast_pipeline::config::TemperatureUnits;
use forecast_pipeline::error::{ExtractError, LoadError};
use forecast_pipeline::extract::{Extractor, ExtractorConfig, ForecastProvider};
use forecast_pipeline::models::{Granularity, PartitionKey, WarehouseRow};
use forecast_pipeline::orchestrator::{
    Alert, AlertSink, Orchestrator, OrchestratorConfig, RetryPolicy, StateTable,
};
use forecast_pipeline::store::{LocalObjectStore, PartitionStore};
use forecast_pipeline::transform::{TransformConfig, TransformEngine};
use forecast_pipeline::warehouse::{
    ConnectionPool, Loader, LoaderConfig, ParquetTable, ParquetWarehouse, ReplaceOutcome,
    Warehouse,
};

pub fn hour(h: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::TimeDelta::hours(h)
}

/// Provider-shaped forecast point at `hour(h)`.
pub fn point(location: &str, h: i64, temp: f64) -> Value {
    json!({
        "location_id": location,
        "dt": hour(h).timestamp(),
        "main": {"temp": temp, "humidity": 71, "pressure": 1012},
        "wind": {"speed": 4.1, "deg": 250},
        "weather": [{"main": "Clouds", "icon": "04d"}],
        "visibility": 10000
    })
}

/// Serves canned points per location and can be told to misbehave.
#[derive(Default)]
pub struct ScriptedProvider {
    points: BTreeMap<String, Vec<Value>>,
    failures: AtomicU32,
    slow_calls: AtomicU32,
    slow_delay_ms: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_points(mut self, location: &str, points: Vec<Value>) -> Self {
        self.points.insert(location.to_string(), points);
        self
    }

    /// Fail the next `n` calls with a network error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Delay the next `n` calls.
    pub fn slow_next(&self, n: u32, delay: Duration) {
        self.slow_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
        self.slow_calls.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn locations(&self) -> Vec<String> {
        self.points.keys().cloned().collect()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ForecastProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, location: &str, _steps: u32) -> Result<Vec<Value>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.slow_calls) {
            let delay = self.slow_delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if Self::take(&self.failures) {
            return Err(ExtractError::Network("scripted outage".into()));
        }
        Ok(self.points.get(location).cloned().unwrap_or_default())
    }
}

/// Parquet warehouse whose replaces can be made to fail before touching disk.
pub struct FlakyWarehouse {
    inner: ParquetWarehouse,
    failures: AtomicU32,
    replace_calls: AtomicU32,
}

impl FlakyWarehouse {
    pub fn new(inner: ParquetWarehouse) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            replace_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn replace_calls(&self) -> u32 {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &ParquetWarehouse {
        &self.inner
    }
}

#[async_trait]
impl Warehouse for FlakyWarehouse {
    fn table(&self) -> &str {
        self.inner.table()
    }

    async fn replace_partition(
        &self,
        key: &PartitionKey,
        rows: Vec<WarehouseRow>,
    ) -> Result<ReplaceOutcome, LoadError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if ScriptedProvider::take(&self.failures) {
            return Err(LoadError::Unreachable("scripted connection reset".into()));
        }
        self.inner.replace_partition(key, rows).await
    }

    async fn delete_partition(&self, key: &PartitionKey) -> Result<usize, LoadError> {
        self.inner.delete_partition(key).await
    }

    async fn read_partition(&self, key: &PartitionKey) -> Result<Vec<WarehouseRow>, LoadError> {
        self.inner.read_partition(key).await
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LoadError> {
        self.inner.partitions().await
    }
}

#[derive(Default)]
pub struct CollectingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for CollectingAlerts {
    async fn raise(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub retry: RetryPolicy,
    pub stage_timeout: Duration,
    pub worker_concurrency: usize,
    pub max_invalid_fraction: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(5)),
            stage_timeout: Duration::from_secs(10),
            worker_concurrency: 4,
            max_invalid_fraction: 0.2,
        }
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub provider: Arc<ScriptedProvider>,
    pub warehouse: Arc<FlakyWarehouse>,
    pub alerts: Arc<CollectingAlerts>,
    pub store: PartitionStore,
}

pub fn state_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("state").join("partitions.json")
}

/// Wire a full pipeline rooted in `dir`. Everything except the provider is on disk,
/// so a second harness on the same directory sees the first one's work.
pub async fn harness(dir: &TempDir, provider: ScriptedProvider, options: Options) -> Harness {
    let provider = Arc::new(provider);
    let store = PartitionStore::new(Arc::new(LocalObjectStore::new(dir.path().join("lake"))));

    let extractor = Extractor::new(
        provider.clone(),
        store.clone(),
        ExtractorConfig {
            locations: provider.locations(),
            units: TemperatureUnits::Celsius,
            step_hours: 3,
            max_steps: 40,
            local_retries: 0,
            local_retry_delay: Duration::ZERO,
        },
    );
    let transform = TransformEngine::new(
        store.clone(),
        TransformConfig {
            max_invalid_fraction: options.max_invalid_fraction,
        },
    );

    let parquet = ParquetWarehouse::new(
        dir.path().join("warehouse"),
        "forecast_hourly",
        ParquetTable::new(),
    );
    let warehouse = Arc::new(FlakyWarehouse::new(parquet));
    let loader = Loader::new(
        warehouse.clone(),
        ConnectionPool::new(2, Duration::from_secs(1)),
        store.clone(),
        LoaderConfig {
            local_retries: 0,
            local_retry_delay: Duration::ZERO,
        },
    );

    let state = StateTable::open(state_path(dir)).await.unwrap();
    let alerts = Arc::new(CollectingAlerts::default());
    let orchestrator = Orchestrator::new(
        extractor,
        transform,
        loader,
        store.clone(),
        state,
        alerts.clone(),
        OrchestratorConfig {
            granularity: Granularity::Hourly,
            worker_concurrency: options.worker_concurrency,
            stage_timeout: options.stage_timeout,
            retry: options.retry,
        },
    );

    Harness {
        orchestrator,
        provider,
        warehouse,
        alerts,
        store,
    }
}
