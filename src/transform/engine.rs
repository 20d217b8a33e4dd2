use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use super::coercion::{coerce_location, coerce_numeric, coerce_text, coerce_timestamp, Coerced};
use super::report::TransformReport;
use super::schema_map::{
    first_present, is_known_path, metric_paths, CATEGORY_PATHS, LOCATION_PATHS,
    SOURCE_TIME_PATHS, TIME_PATHS,
};
use crate::config::TransformSettings;
use crate::error::{StoreError, TransformError};
use crate::models::{ForecastRecord, Metric, PartitionKey, RawRecord};
use crate::store::PartitionStore;
use crate::utils::json_path::leaf_paths;

#[derive(Debug, Clone, Copy)]
pub struct TransformConfig {
    pub max_invalid_fraction: f64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self::from(&TransformSettings::default())
    }
}

impl From<&TransformSettings> for TransformConfig {
    fn from(settings: &TransformSettings) -> Self {
        Self {
            max_invalid_fraction: settings.max_invalid_fraction,
        }
    }
}

/// Warehouse-ready rows of one partition plus the quality report that produced them.
#[derive(Debug, Clone)]
pub struct TransformedBatch {
    pub partition_key: PartitionKey,
    pub rows: Vec<ForecastRecord>,
    pub report: TransformReport,
}

/// Per-record mapping result.
struct Mapped {
    seq: u64,
    record: Option<ForecastRecord>,
    nulled: Vec<Metric>,
    unknown: Vec<String>,
}

fn map_record(raw: &RawRecord) -> Mapped {
    let payload = &raw.payload;
    let unknown = leaf_paths(payload)
        .into_iter()
        .filter(|path| !is_known_path(path))
        .collect();

    let location = first_present(payload, LOCATION_PATHS).and_then(coerce_location);
    let forecast_time: Option<DateTime<Utc>> =
        first_present(payload, TIME_PATHS).and_then(coerce_timestamp);

    let mut nulled = Vec::new();
    let mut values = Vec::with_capacity(Metric::ALL.len());
    for metric in Metric::ALL {
        match coerce_numeric(first_present(payload, metric_paths(metric))) {
            Coerced::Value(v) => values.push((metric, Some(v))),
            Coerced::Absent => values.push((metric, None)),
            Coerced::Violation => {
                nulled.push(metric);
                values.push((metric, None));
            }
        }
    }

    let record = match (location, forecast_time) {
        (Some(location), Some(forecast_time)) => {
            let mut record = ForecastRecord::new(location, forecast_time);
            for (metric, value) in values {
                record.set_metric(metric, value);
            }
            record.weather_category = first_present(payload, CATEGORY_PATHS).and_then(coerce_text);
            record.source_timestamp = first_present(payload, SOURCE_TIME_PATHS).and_then(coerce_text);
            Some(record)
        }
        _ => None,
    };

    Mapped {
        seq: raw.seq,
        record,
        nulled,
        unknown,
    }
}

/// Maps raw partitions onto typed, deduplicated forecast rows.
#[derive(Clone)]
pub struct TransformEngine {
    store: PartitionStore,
    config: TransformConfig,
}

impl TransformEngine {
    pub fn new(store: PartitionStore, config: TransformConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Pure core of the transform: mapping, coercion, quality gate and dedup.
    pub fn transform_records(
        &self,
        records: &[RawRecord],
    ) -> Result<(Vec<ForecastRecord>, TransformReport), TransformError> {
        transform_records(records, &self.config)
    }

    /// Transform the stored raw partition and persist the result.
    pub async fn transform(&self, key: &PartitionKey) -> Result<TransformedBatch, TransformError> {
        let raw = match self.store.read_raw(key).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => {
                return Err(TransformError::MissingRawBatch(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let config = self.config;
        let (rows, report) =
            tokio::task::spawn_blocking(move || transform_records(&raw, &config))
                .await
                .map_err(|e| TransformError::Aborted(e.to_string()))??;

        if !report.unknown_fields.is_empty() {
            info!(
                partition = %key,
                fields = ?report.unknown_fields,
                "ignoring unknown provider fields"
            );
        }
        if report.records_with_violations > 0 {
            warn!(
                partition = %key,
                affected = report.records_with_violations,
                nulled = report.total_nulled(),
                "nulled non-coercible numeric values"
            );
        }

        self.store.write_transformed(key, &rows, &report).await?;
        info!(
            partition = %key,
            raw = report.raw_records,
            kept = report.kept,
            dropped = report.dropped_missing_required,
            duplicates = report.duplicates_removed,
            "transformed partition written"
        );

        Ok(TransformedBatch {
            partition_key: key.clone(),
            rows,
            report,
        })
    }
}

pub fn transform_records(
    records: &[RawRecord],
    config: &TransformConfig,
) -> Result<(Vec<ForecastRecord>, TransformReport), TransformError> {
    let mapped: Vec<Mapped> = records.par_iter().map(map_record).collect();

    let mut report = TransformReport {
        raw_records: records.len(),
        ..Default::default()
    };
    let mut unknown = BTreeSet::new();
    let mut latest: HashMap<(String, DateTime<Utc>), (u64, ForecastRecord)> = HashMap::new();
    let mut candidates = 0usize;

    for item in mapped {
        unknown.extend(item.unknown);
        if !item.nulled.is_empty() {
            report.records_with_violations += 1;
            for metric in &item.nulled {
                *report.nulled_fields.entry(metric.column().to_string()).or_default() += 1;
            }
        }

        let Some(record) = item.record else {
            report.dropped_missing_required += 1;
            continue;
        };
        candidates += 1;

        let dedup_key = (record.location_id.clone(), record.forecast_time);
        let arrived_later = latest
            .get(&dedup_key)
            .map_or(true, |(seq, _)| item.seq > *seq);
        if arrived_later {
            latest.insert(dedup_key, (item.seq, record));
        }
    }

    report.unknown_fields = unknown;
    report.violation_fraction = if records.is_empty() {
        0.0
    } else {
        report.records_with_violations as f64 / records.len() as f64
    };

    if report.violation_fraction > config.max_invalid_fraction {
        return Err(TransformError::QualityThreshold {
            affected: report.records_with_violations,
            total: report.raw_records,
            fraction: report.violation_fraction,
            threshold: config.max_invalid_fraction,
        });
    }

    let mut rows: Vec<ForecastRecord> = latest.into_values().map(|(_, record)| record).collect();
    rows.sort_by(|a, b| {
        a.location_id
            .cmp(&b.location_id)
            .then(a.forecast_time.cmp(&b.forecast_time))
    });

    report.duplicates_removed = candidates - rows.len();
    report.kept = rows.len();
    debug!(
        raw = report.raw_records,
        kept = report.kept,
        fraction = report.violation_fraction,
        "transform complete"
    );

    Ok((rows, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn raw(seq: u64, payload: Value) -> RawRecord {
        RawRecord {
            seq,
            fetched_at: Utc::now(),
            source_location: "2643743".to_string(),
            payload,
        }
    }

    fn point(location: Value, ts: &str, temp: Value) -> Value {
        json!({
            "location_id": location,
            "timestamp": ts,
            "main": {"temp": temp, "humidity": 70, "pressure": "1012"},
            "wind": {"speed": 3.2, "deg": 180},
            "weather": [{"main": "Clouds", "icon": "04d"}],
        })
    }

    #[test]
    fn test_nested_payload_is_mapped_and_typed() {
        let (rows, report) = transform_records(
            &[raw(0, point(json!(2643743), "2024-06-01T00:00:00Z", json!(12.5)))],
            &TransformConfig::default(),
        )
        .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.location_id, "2643743");
        assert_eq!(row.temperature, Some(12.5));
        assert_eq!(row.humidity, Some(70.0));
        assert_eq!(row.pressure, Some(1012.0));
        assert_eq!(row.wind_direction, Some(180.0));
        assert_eq!(row.weather_category.as_deref(), Some("Clouds"));
        assert_eq!(
            report.unknown_fields.into_iter().collect::<Vec<_>>(),
            vec!["weather.0.icon".to_string()]
        );
    }

    #[test]
    fn test_alternate_aliases_are_accepted() {
        let payload = json!({
            "city": {"id": 7},
            "dt": 1717200000,
            "temperature": "9.5",
            "weather_category": "Rain",
        });
        let (rows, _) = transform_records(&[raw(0, payload)], &TransformConfig::default()).unwrap();
        assert_eq!(rows[0].location_id, "7");
        assert_eq!(rows[0].temperature, Some(9.5));
        assert_eq!(rows[0].weather_category.as_deref(), Some("Rain"));
    }

    #[test]
    fn test_later_arrival_wins_on_duplicate_key() {
        let records = vec![
            raw(0, point(json!("a"), "2024-06-01T03:00:00Z", json!(10.0))),
            raw(5, point(json!("a"), "2024-06-01T03:00:00Z", json!(11.0))),
            raw(2, point(json!("a"), "2024-06-01T03:00:00Z", json!(12.0))),
        ];
        let (rows, report) = transform_records(&records, &TransformConfig::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temperature, Some(11.0));
        assert_eq!(report.duplicates_removed, 2);
    }

    #[test]
    fn test_violations_at_threshold_are_nulled_not_dropped() {
        let records: Vec<RawRecord> = (0..10)
            .map(|i| {
                let temp = if i < 2 { json!("broken") } else { json!(i as f64) };
                raw(i, point(json!("a"), &format!("2024-06-01T{i:02}:00:00Z"), temp))
            })
            .collect();

        let (rows, report) = transform_records(&records, &TransformConfig::default()).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(report.records_with_violations, 2);
        assert_eq!(report.nulled_fields.get("temperature"), Some(&2));
        assert_eq!(rows.iter().filter(|r| r.temperature.is_none()).count(), 2);
    }

    #[test]
    fn test_violations_above_threshold_fail_the_batch() {
        let records: Vec<RawRecord> = (0..10)
            .map(|i| {
                let temp = if i < 3 { json!({"v": 1}) } else { json!(1.0) };
                raw(i, point(json!("a"), &format!("2024-06-01T{i:02}:00:00Z"), temp))
            })
            .collect();

        let err = transform_records(&records, &TransformConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::QualityThreshold { affected: 3, total: 10, .. }
        ));
        assert!(!crate::error::Classify::is_retryable(&err));
    }

    #[test]
    fn test_rows_are_sorted_by_location_then_time() {
        let records = vec![
            raw(0, point(json!("b"), "2024-06-01T01:00:00Z", json!(1))),
            raw(1, point(json!("a"), "2024-06-01T02:00:00Z", json!(1))),
            raw(2, point(json!("a"), "2024-06-01T01:00:00Z", json!(1))),
        ];
        let (rows, _) = transform_records(&records, &TransformConfig::default()).unwrap();
        let order: Vec<(String, u32)> = rows
            .iter()
            .map(|r| (r.location_id.clone(), chrono::Timelike::hour(&r.forecast_time)))
            .collect();
        assert_eq!(
            order,
            vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 1)]
        );
    }

    #[test]
    fn test_empty_batch_transforms_to_nothing() {
        let (rows, report) = transform_records(&[], &TransformConfig::default()).unwrap();
        assert!(rows.is_empty());
        assert_eq!(report.violation_fraction, 0.0);
    }
}
