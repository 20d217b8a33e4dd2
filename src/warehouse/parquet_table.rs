use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::error::{LoadError, PipelineError, Result};
use crate::models::{ForecastRecord, Metric, WarehouseRow};
use crate::utils::constants::*;

const PARTITION_KEY_COLUMN: &str = "partition_key";
const LOCATION_COLUMN: &str = "location_id";
const FORECAST_TIME_COLUMN: &str = "forecast_time";
const CATEGORY_COLUMN: &str = "weather_category";
const SOURCE_TIME_COLUMN: &str = "source_timestamp";
const UTC: &str = "UTC";

fn io_error(path: &Path, source: std::io::Error) -> LoadError {
    LoadError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parquet_error(path: &Path, source: parquet::errors::ParquetError) -> LoadError {
    LoadError::Parquet {
        path: path.display().to_string(),
        source,
    }
}

/// Parquet encoding of warehouse rows.
#[derive(Debug, Clone)]
pub struct ParquetTable {
    compression: Compression,
    row_group_size: usize,
}

impl Default for ParquetTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParquetTable {
    pub fn new() -> Self {
        Self {
            compression: Compression::SNAPPY,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }

    pub fn with_compression(mut self, compression: &str) -> Result<Self> {
        self.compression = match compression.to_lowercase().as_str() {
            COMPRESSION_SNAPPY => Compression::SNAPPY,
            COMPRESSION_GZIP => Compression::GZIP(GzipLevel::default()),
            COMPRESSION_LZ4 => Compression::LZ4,
            COMPRESSION_ZSTD => Compression::ZSTD(ZstdLevel::default()),
            COMPRESSION_NONE => Compression::UNCOMPRESSED,
            _ => {
                return Err(PipelineError::Config(format!(
                    "Unsupported compression: {}",
                    compression
                )))
            }
        };
        Ok(self)
    }

    pub fn with_row_group_size(mut self, size: usize) -> Self {
        self.row_group_size = size.max(1);
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Arrow schema of the warehouse table.
    pub fn schema() -> SchemaRef {
        let mut fields = vec![
            Field::new(PARTITION_KEY_COLUMN, DataType::Utf8, false),
            Field::new(LOCATION_COLUMN, DataType::Utf8, false),
            Field::new(
                FORECAST_TIME_COLUMN,
                DataType::Timestamp(TimeUnit::Millisecond, Some(UTC.into())),
                false,
            ),
        ];
        fields.extend(
            Metric::ALL
                .iter()
                .map(|m| Field::new(m.column(), DataType::Float64, true)),
        );
        fields.push(Field::new(CATEGORY_COLUMN, DataType::Utf8, true));
        fields.push(Field::new(SOURCE_TIME_COLUMN, DataType::Utf8, true));

        Arc::new(Schema::new(fields))
    }

    pub fn rows_to_batch(rows: &[WarehouseRow]) -> std::result::Result<RecordBatch, LoadError> {
        let partition_keys: Vec<&str> = rows.iter().map(|r| r.partition_key.as_str()).collect();
        let locations: Vec<&str> = rows.iter().map(|r| r.record.location_id.as_str()).collect();
        let times: Vec<i64> = rows
            .iter()
            .map(|r| r.record.forecast_time.timestamp_millis())
            .collect();

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(partition_keys)),
            Arc::new(StringArray::from(locations)),
            Arc::new(TimestampMillisecondArray::from(times).with_timezone(UTC)),
        ];
        for metric in Metric::ALL {
            let values: Vec<Option<f64>> = rows.iter().map(|r| r.record.metric(metric)).collect();
            columns.push(Arc::new(Float64Array::from(values)));
        }
        let categories: Vec<Option<&str>> = rows
            .iter()
            .map(|r| r.record.weather_category.as_deref())
            .collect();
        let source_times: Vec<Option<&str>> = rows
            .iter()
            .map(|r| r.record.source_timestamp.as_deref())
            .collect();
        columns.push(Arc::new(StringArray::from(categories)));
        columns.push(Arc::new(StringArray::from(source_times)));

        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    /// Write `rows` to `path` and fsync. An empty slice still yields a valid, empty file.
    pub fn write_rows(
        &self,
        rows: &[WarehouseRow],
        path: &Path,
    ) -> std::result::Result<(), LoadError> {
        let file = File::create(path).map_err(|e| io_error(path, e))?;
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build();

        let sink = file.try_clone().map_err(|e| io_error(path, e))?;
        let mut writer =
            ArrowWriter::try_new(sink, Self::schema(), Some(props)).map_err(|e| parquet_error(path, e))?;
        for chunk in rows.chunks(self.row_group_size) {
            let batch = Self::rows_to_batch(chunk)?;
            writer.write(&batch).map_err(|e| parquet_error(path, e))?;
        }
        writer.close().map_err(|e| parquet_error(path, e))?;
        file.sync_all().map_err(|e| io_error(path, e))?;
        Ok(())
    }

    pub fn read_rows(path: &Path) -> std::result::Result<Vec<WarehouseRow>, LoadError> {
        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| parquet_error(path, e))?
            .with_batch_size(8192)
            .build()
            .map_err(|e| parquet_error(path, e))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            rows.extend(batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    pub fn file_info(&self, path: &Path) -> std::result::Result<ParquetFileInfo, LoadError> {
        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let reader = SerializedFileReader::new(file).map_err(|e| parquet_error(path, e))?;
        let metadata = reader.metadata();

        let row_groups = metadata.num_row_groups();
        let row_group_sizes = (0..row_groups)
            .map(|i| metadata.row_group(i).num_rows())
            .collect();
        let file_size = std::fs::metadata(path).map_err(|e| io_error(path, e))?.len();

        Ok(ParquetFileInfo {
            total_rows: metadata.file_metadata().num_rows(),
            row_groups,
            row_group_sizes,
            file_size,
            compression: metadata
                .row_groups()
                .first()
                .and_then(|rg| rg.columns().first())
                .map(|c| c.compression())
                .unwrap_or(self.compression),
        })
    }
}

fn column<'a, T: 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> std::result::Result<&'a T, LoadError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| LoadError::Schema(format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| LoadError::Schema(format!("invalid {name} column type")))
}

fn batch_to_rows(batch: &RecordBatch) -> std::result::Result<Vec<WarehouseRow>, LoadError> {
    let partition_keys = column::<StringArray>(batch, PARTITION_KEY_COLUMN)?;
    let locations = column::<StringArray>(batch, LOCATION_COLUMN)?;
    let times = column::<TimestampMillisecondArray>(batch, FORECAST_TIME_COLUMN)?;
    let categories = column::<StringArray>(batch, CATEGORY_COLUMN)?;
    let source_times = column::<StringArray>(batch, SOURCE_TIME_COLUMN)?;
    let metrics = Metric::ALL
        .iter()
        .map(|m| column::<Float64Array>(batch, m.column()).map(|array| (*m, array)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let text = |array: &StringArray, i: usize| {
        (!array.is_null(i)).then(|| array.value(i).to_string())
    };

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let millis = times.value(i);
        let forecast_time = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| LoadError::Schema(format!("timestamp {millis} out of range")))?;

        let mut record = ForecastRecord::new(locations.value(i), forecast_time);
        for (metric, array) in &metrics {
            let value = (!array.is_null(i)).then(|| array.value(i));
            record.set_metric(*metric, value);
        }
        record.weather_category = text(categories, i);
        record.source_timestamp = text(source_times, i);

        rows.push(WarehouseRow {
            partition_key: partition_keys.value(i).to_string(),
            record,
        });
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct ParquetFileInfo {
    pub total_rows: i64,
    pub row_groups: usize,
    pub row_group_sizes: Vec<i64>,
    pub file_size: u64,
    pub compression: Compression,
}

impl ParquetFileInfo {
    pub fn summary(&self) -> String {
        format!(
            "Parquet File Summary:\n\
            - Total rows: {}\n\
            - Row groups: {}\n\
            - File size: {:.2} KB\n\
            - Compression: {:?}",
            self.total_rows,
            self.row_groups,
            self.file_size as f64 / 1024.0,
            self.compression
        )
    }
}
