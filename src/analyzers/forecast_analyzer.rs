use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Metric, PartitionKey, WarehouseRow};
use crate::warehouse::Warehouse;

/// Row filter for dashboard queries. Time bounds are half-open: `[from, to)`.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub location: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl QueryFilter {
    fn matches(&self, row: &WarehouseRow) -> bool {
        let record = &row.record;
        if self
            .location
            .as_deref()
            .is_some_and(|loc| loc != record.location_id)
        {
            return false;
        }
        if self.from.is_some_and(|from| record.forecast_time < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.forecast_time >= to) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub location_id: String,
    pub forecast_time: DateTime<Utc>,
    pub value: Option<f64>,
    /// Forecast run the value came from.
    pub partition_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub location_id: String,
    pub date: NaiveDate,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Non-null values that went into the aggregate.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub table: String,
    pub total_rows: usize,
    pub partitions: usize,
    pub locations: usize,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub null_counts: BTreeMap<String, usize>,
}

impl DatasetSummary {
    pub fn summary(&self) -> String {
        let range = match self.time_range {
            Some((first, last)) => format!("{} to {}", first.to_rfc3339(), last.to_rfc3339()),
            None => "empty".to_string(),
        };
        let mut out = format!(
            "Table: {}\n\
            Rows: {} across {} partitions\n\
            Locations: {}\n\
            Forecast Range: {}",
            self.table, self.total_rows, self.partitions, self.locations, range
        );

        let nulls: Vec<String> = self
            .null_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(column, count)| format!("  {column}: {count}"))
            .collect();
        if !nulls.is_empty() {
            out.push_str("\nNull values:\n");
            out.push_str(&nulls.join("\n"));
        }
        out
    }
}

/// Read-only queries over the warehouse table.
pub struct ForecastAnalyzer {
    warehouse: Arc<dyn Warehouse>,
}

impl ForecastAnalyzer {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    async fn partition_rows(&self) -> Result<Vec<(PartitionKey, Vec<WarehouseRow>)>> {
        let mut keys = self.warehouse.partitions().await?;
        keys.sort();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let rows = self.warehouse.read_partition(&key).await?;
            out.push((key, rows));
        }
        Ok(out)
    }

    /// Matching rows with one row per (location, forecast time). When several
    /// forecast runs cover the same slot, the most recent partition wins.
    async fn latest_rows(&self, filter: &QueryFilter) -> Result<Vec<WarehouseRow>> {
        let mut latest: BTreeMap<(String, DateTime<Utc>), WarehouseRow> = BTreeMap::new();
        for (_, rows) in self.partition_rows().await? {
            for row in rows.into_iter().filter(|r| filter.matches(r)) {
                let slot = (row.record.location_id.clone(), row.record.forecast_time);
                latest.insert(slot, row);
            }
        }
        Ok(latest.into_values().collect())
    }

    pub async fn time_series(
        &self,
        metric: Metric,
        filter: &QueryFilter,
    ) -> Result<Vec<TimeSeriesPoint>> {
        Ok(self
            .latest_rows(filter)
            .await?
            .into_iter()
            .map(|row| TimeSeriesPoint {
                value: row.record.metric(metric),
                location_id: row.record.location_id,
                forecast_time: row.record.forecast_time,
                partition_key: row.partition_key,
            })
            .collect())
    }

    /// Per-location, per-UTC-day min/max/mean of `metric`.
    pub async fn daily_aggregates(
        &self,
        metric: Metric,
        filter: &QueryFilter,
    ) -> Result<Vec<DailyAggregate>> {
        let mut groups: BTreeMap<(String, NaiveDate), Vec<f64>> = BTreeMap::new();
        for row in self.latest_rows(filter).await? {
            let values = groups
                .entry((row.record.location_id.clone(), row.record.forecast_time.date_naive()))
                .or_default();
            if let Some(value) = row.record.metric(metric) {
                values.push(value);
            }
        }

        Ok(groups
            .into_iter()
            .map(|((location_id, date), values)| {
                let count = values.len();
                let (min, max, mean) = if count == 0 {
                    (None, None, None)
                } else {
                    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let mean = values.iter().sum::<f64>() / count as f64;
                    (Some(min), Some(max), Some(mean))
                };
                DailyAggregate {
                    location_id,
                    date,
                    min,
                    max,
                    mean,
                    count,
                }
            })
            .collect())
    }

    pub async fn summary(&self) -> Result<DatasetSummary> {
        let partitions = self.partition_rows().await?;

        let mut total_rows = 0;
        let mut locations = BTreeSet::new();
        let mut time_range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        let mut null_counts: BTreeMap<String, usize> = Metric::ALL
            .iter()
            .map(|m| (m.column().to_string(), 0))
            .collect();
        null_counts.insert("weather_category".to_string(), 0);

        for (_, rows) in &partitions {
            total_rows += rows.len();
            for row in rows {
                let record = &row.record;
                locations.insert(record.location_id.as_str());
                let t = record.forecast_time;
                time_range = Some(match time_range {
                    Some((first, last)) => (first.min(t), last.max(t)),
                    None => (t, t),
                });
                for metric in Metric::ALL {
                    if record.metric(metric).is_none() {
                        *null_counts.entry(metric.column().to_string()).or_default() += 1;
                    }
                }
                if record.weather_category.is_none() {
                    *null_counts.entry("weather_category".to_string()).or_default() += 1;
                }
            }
        }

        Ok(DatasetSummary {
            table: self.warehouse.table().to_string(),
            total_rows,
            partitions: partitions.len(),
            locations: locations.len(),
            time_range,
            null_counts,
        })
    }
}

/// Write any serializable query result as CSV with a header row.
pub fn write_csv<T: Serialize, W: Write>(rows: &[T], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}
