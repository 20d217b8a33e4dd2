use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forecast_pipeline::models::{ForecastRecord, Metric, PartitionKey, RawRecord, WarehouseRow};
use forecast_pipeline::transform::{transform_records, TransformConfig};
use forecast_pipeline::warehouse::{validate_batch, ParquetTable};
use serde_json::json;

// Raw batch shaped like a provider response: `locations` x `steps`, with a
// sprinkling of duplicates, bad numerics and unknown fields.
fn create_raw_batch(locations: usize, steps: usize) -> Vec<RawRecord> {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let mut records = Vec::with_capacity(locations * steps);
    let mut seq = 0u64;

    for location in 0..locations {
        for step in 0..steps {
            let t = base + chrono::TimeDelta::hours(3 * step as i64);
            let temp = if seq % 50 == 0 {
                json!("n/a")
            } else {
                json!(10.0 + (step as f64) * 0.3)
            };
            records.push(RawRecord {
                seq,
                fetched_at: base,
                source_location: location.to_string(),
                payload: json!({
                    "location_id": location,
                    "timestamp": t.to_rfc3339(),
                    "main": {"temp": temp, "humidity": 70, "pressure": 1013},
                    "wind": {"speed": 3.5, "deg": 200},
                    "weather": [{"main": "Rain", "icon": "10d"}],
                    "rain": {"3h": 0.4}
                }),
            });
            seq += 1;
        }
    }
    // Re-delivered tail of the first location
    for step in 0..steps.min(5) {
        let mut dup = records[step].clone();
        dup.seq = seq;
        seq += 1;
        records.push(dup);
    }
    records
}

fn benchmark_transform(c: &mut Criterion) {
    let raw = create_raw_batch(20, 40);
    let config = TransformConfig::default();

    c.bench_function("transform_records", |b| {
        b.iter(|| {
            let (rows, report) = transform_records(black_box(&raw), &config).unwrap();
            black_box((rows.len(), report.duplicates_removed))
        })
    });
}

fn benchmark_validate_batch(c: &mut Criterion) {
    let key = PartitionKey::parse("2024-06-01").unwrap();
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let rows: Vec<WarehouseRow> = (0..2000)
        .map(|i| {
            let record = ForecastRecord::new(format!("loc-{}", i % 50), base + chrono::TimeDelta::hours(i / 50))
                .with_metric(Metric::Temperature, 12.0);
            WarehouseRow::new(&key, record)
        })
        .collect();

    c.bench_function("validate_batch", |b| {
        b.iter(|| black_box(validate_batch(&key, &rows).is_ok()))
    });

    c.bench_function("rows_to_arrow_batch", |b| {
        b.iter(|| black_box(ParquetTable::rows_to_batch(&rows).map(|batch| batch.num_rows())))
    });
}

fn benchmark_varying_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform_by_size");
    let config = TransformConfig::default();

    for &locations in &[5, 50, 200] {
        group.bench_with_input(
            BenchmarkId::new("locations", locations),
            &locations,
            |b, &locations| {
                let raw = create_raw_batch(locations, 40);
                b.iter(|| black_box(transform_records(&raw, &config).map(|(rows, _)| rows.len())))
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_transform,
    benchmark_validate_batch,
    benchmark_varying_batch_sizes
);
criterion_main!(benches);
