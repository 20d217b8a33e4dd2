use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::normalize::normalize_point;
use super::provider::ForecastProvider;
use crate::config::{ProviderSettings, TemperatureUnits};
use crate::error::ExtractError;
use crate::models::{PartitionKey, RawRecord, TimeWindow};
use crate::store::PartitionStore;
use crate::utils::with_local_retries;

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub locations: Vec<String>,
    pub units: TemperatureUnits,
    pub step_hours: u32,
    pub max_steps: u32,
    pub local_retries: u32,
    pub local_retry_delay: Duration,
}

impl From<&ProviderSettings> for ExtractorConfig {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            locations: settings.locations.clone(),
            units: settings.units,
            step_hours: settings.step_hours,
            max_steps: settings.max_steps,
            local_retries: settings.local_retries,
            local_retry_delay: settings.local_retry_delay(),
        }
    }
}

/// Raw records of one extraction run.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub partition_key: PartitionKey,
    pub window: TimeWindow,
    pub records: Vec<RawRecord>,
    pub locations: Vec<String>,
}

pub struct Extractor {
    provider: Arc<dyn ForecastProvider>,
    store: PartitionStore,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        store: PartitionStore,
        config: ExtractorConfig,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Forecast steps needed to cover `window` from `now`.
    pub fn steps_for_window(&self, window: &TimeWindow, now: DateTime<Utc>) -> u32 {
        let step_secs = i64::from(self.config.step_hours.max(1)) * 3600;
        let remaining = (window.end - now).num_seconds();
        let steps = if remaining <= 0 {
            1
        } else {
            let needed = (remaining + step_secs - 1) / step_secs;
            u32::try_from(needed).unwrap_or(u32::MAX)
        };
        steps.clamp(1, self.config.max_steps.max(1))
    }

    /// Pull every configured location and replace the raw partition.
    ///
    /// Re-running for the same key rewrites the partition; nothing is appended.
    pub async fn extract(
        &self,
        key: &PartitionKey,
        window: TimeWindow,
    ) -> Result<RawBatch, ExtractError> {
        if self.config.locations.is_empty() {
            return Err(ExtractError::NoLocations);
        }

        let steps = self.steps_for_window(&window, Utc::now());
        info!(
            partition = %key,
            provider = self.provider.name(),
            locations = self.config.locations.len(),
            steps,
            "extracting forecast"
        );

        let mut records = Vec::new();
        let mut seq = 0u64;
        for location in &self.config.locations {
            let points = with_local_retries(
                "provider fetch",
                self.config.local_retries,
                self.config.local_retry_delay,
                || self.provider.fetch(location, steps),
            )
            .await?;

            let fetched_at = Utc::now();
            debug!(partition = %key, location = %location, points = points.len(), "fetched");
            for point in points {
                let payload = normalize_point(point, self.config.units, location)?;
                records.push(RawRecord {
                    seq,
                    fetched_at,
                    source_location: location.clone(),
                    payload,
                });
                seq += 1;
            }
        }

        let manifest = self.store.write_raw(key, window, &records).await?;
        info!(
            partition = %key,
            records = manifest.record_count,
            files = manifest.files.len(),
            "raw partition written"
        );

        Ok(RawBatch {
            partition_key: key.clone(),
            window,
            records,
            locations: self.config.locations.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        transient_failures: AtomicU32,
    }

    #[async_trait]
    impl ForecastProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, location: &str, _steps: u32) -> Result<Vec<Value>, ExtractError> {
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExtractError::Network("connection reset".into()));
            }
            Ok(vec![
                json!({"location_id": location, "dt": 1717200000, "main": {"temp": 12.0}}),
                json!({"location_id": location, "dt": 1717210800, "main": {"temp": 13.0}}),
            ])
        }
    }

    fn config(locations: &[&str], local_retries: u32) -> ExtractorConfig {
        ExtractorConfig {
            locations: locations.iter().map(|l| l.to_string()).collect(),
            units: TemperatureUnits::Celsius,
            step_hours: 3,
            max_steps: 40,
            local_retries,
            local_retry_delay: Duration::ZERO,
        }
    }

    fn build(failures: u32, local_retries: u32) -> (Extractor, PartitionStore) {
        let store = PartitionStore::new(Arc::new(InMemoryObjectStore::new()));
        let provider = Arc::new(Scripted {
            transient_failures: AtomicU32::new(failures),
        });
        let extractor = Extractor::new(provider, store.clone(), config(&["a", "b"], local_retries));
        (extractor, store)
    }

    #[test]
    fn test_steps_cover_window_and_are_clamped() {
        let (extractor, _) = build(0, 0);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap();
        let day = PartitionKey::parse("2024-06-01").unwrap().window();
        assert_eq!(extractor.steps_for_window(&day, now), 8);

        let past = PartitionKey::parse("2024-05-01").unwrap().window();
        assert_eq!(extractor.steps_for_window(&past, now), 1);

        let far = TimeWindow::new(now, now + chrono::TimeDelta::days(30));
        assert_eq!(extractor.steps_for_window(&far, now), 40);
    }

    #[tokio::test]
    async fn test_extract_writes_sequenced_raw_partition() {
        let (extractor, store) = build(0, 0);
        let key = PartitionKey::parse("2024-06-01T00").unwrap();

        let batch = extractor.extract(&key, key.window()).await.unwrap();
        assert_eq!(batch.records.len(), 4);
        let seqs: Vec<u64> = batch.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(batch.records[0].payload["timestamp"], json!("2024-06-01T00:00:00Z"));

        let stored = store.read_raw(&key).await.unwrap();
        assert_eq!(stored, batch.records);
    }

    #[tokio::test]
    async fn test_transient_provider_errors_are_retried_in_stage() {
        let (extractor, _) = build(2, 2);
        let key = PartitionKey::parse("2024-06-01T00").unwrap();
        assert!(extractor.extract(&key, key.window()).await.is_ok());

        let (extractor, _) = build(3, 2);
        let err = extractor.extract(&key, key.window()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Network(_)));
    }

    #[tokio::test]
    async fn test_no_locations_is_a_configuration_error() {
        let store = PartitionStore::new(Arc::new(InMemoryObjectStore::new()));
        let provider = Arc::new(Scripted {
            transient_failures: AtomicU32::new(0),
        });
        let extractor = Extractor::new(provider, store, config(&[], 0));
        let key = PartitionKey::parse("2024-06-01").unwrap();
        assert!(matches!(
            extractor.extract(&key, key.window()).await,
            Err(ExtractError::NoLocations)
        ));
    }
}
