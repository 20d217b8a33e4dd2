use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::ObjectStore;
use crate::error::StoreError;
use crate::models::{ForecastRecord, PartitionKey, RawRecord, TimeWindow};
use crate::utils::constants::{
    RAW_MANIFEST_FILE, RAW_STAGE, TRANSFORMED_FILE, TRANSFORMED_STAGE, TRANSFORM_REPORT_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreStage {
    Raw,
    Transformed,
}

impl StoreStage {
    pub fn prefix(self) -> &'static str {
        match self {
            StoreStage::Raw => RAW_STAGE,
            StoreStage::Transformed => TRANSFORMED_STAGE,
        }
    }
}

impl fmt::Display for StoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Written after every raw file of an extraction run; a raw partition without
/// one is incomplete and is treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawManifest {
    pub partition_key: PartitionKey,
    pub window: TimeWindow,
    pub written_at: DateTime<Utc>,
    pub locations: Vec<String>,
    pub record_count: usize,
    pub files: Vec<String>,
}

/// Stage-prefixed view over an [`ObjectStore`]: `{stage}/{partition_key}/{file}`.
#[derive(Clone)]
pub struct PartitionStore {
    objects: Arc<dyn ObjectStore>,
}

/// Percent-encodes every byte outside `[A-Za-z0-9-_.]`, so distinct location
/// ids always land in distinct files.
fn location_file(location: &str) -> String {
    let mut safe = String::with_capacity(location.len());
    for byte in location.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            safe.push(char::from(byte));
        } else {
            safe.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("location={safe}.jsonl")
}

fn encode_lines<T: Serialize>(key: &str, items: &[T]) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    for item in items {
        serde_json::to_writer(&mut bytes, item).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

fn decode_lines<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<Vec<T>, StoreError> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| {
            serde_json::from_slice(line).map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })
        })
        .collect()
}

fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

impl PartitionStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    pub fn prefix(stage: StoreStage, key: &PartitionKey) -> String {
        format!("{}/{}", stage.prefix(), key)
    }

    pub fn object_key(stage: StoreStage, key: &PartitionKey, file: &str) -> String {
        format!("{}/{}", Self::prefix(stage, key), file)
    }

    /// Replace the raw partition with `records`, one file per source location.
    pub async fn write_raw(
        &self,
        key: &PartitionKey,
        window: TimeWindow,
        records: &[RawRecord],
    ) -> Result<RawManifest, StoreError> {
        let removed = self.clear(StoreStage::Raw, key).await?;
        if removed > 0 {
            debug!(partition = %key, removed, "cleared previous raw objects");
        }

        let mut by_location: BTreeMap<&str, Vec<&RawRecord>> = BTreeMap::new();
        for record in records {
            by_location
                .entry(record.source_location.as_str())
                .or_default()
                .push(record);
        }

        let mut files = Vec::with_capacity(by_location.len());
        for (location, group) in &by_location {
            let object_key = Self::object_key(StoreStage::Raw, key, &location_file(location));
            let bytes = encode_lines(&object_key, group)?;
            self.objects.put(&object_key, bytes).await?;
            files.push(object_key);
        }

        let manifest = RawManifest {
            partition_key: key.clone(),
            window,
            written_at: Utc::now(),
            locations: by_location.keys().map(|l| l.to_string()).collect(),
            record_count: records.len(),
            files,
        };
        let manifest_key = Self::object_key(StoreStage::Raw, key, RAW_MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|source| StoreError::Codec {
            key: manifest_key.clone(),
            source,
        })?;
        self.objects.put(&manifest_key, bytes).await?;

        Ok(manifest)
    }

    pub async fn read_manifest(&self, key: &PartitionKey) -> Result<RawManifest, StoreError> {
        let manifest_key = Self::object_key(StoreStage::Raw, key, RAW_MANIFEST_FILE);
        let bytes = self.objects.get(&manifest_key).await?;
        decode_json(&manifest_key, &bytes)
    }

    /// Raw records of a complete extraction, in arrival order.
    pub async fn read_raw(&self, key: &PartitionKey) -> Result<Vec<RawRecord>, StoreError> {
        let manifest = self.read_manifest(key).await?;
        let mut records = Vec::with_capacity(manifest.record_count);
        for file in &manifest.files {
            let bytes = self.objects.get(file).await?;
            records.extend(decode_lines::<RawRecord>(file, &bytes)?);
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    pub async fn write_transformed<R: Serialize + Sync>(
        &self,
        key: &PartitionKey,
        rows: &[ForecastRecord],
        report: &R,
    ) -> Result<(), StoreError> {
        let rows_key = Self::object_key(StoreStage::Transformed, key, TRANSFORMED_FILE);
        let bytes = encode_lines(&rows_key, rows)?;
        self.objects.put(&rows_key, bytes).await?;

        let report_key = Self::object_key(StoreStage::Transformed, key, TRANSFORM_REPORT_FILE);
        let bytes = serde_json::to_vec_pretty(report).map_err(|source| StoreError::Codec {
            key: report_key.clone(),
            source,
        })?;
        self.objects.put(&report_key, bytes).await
    }

    pub async fn read_transformed(
        &self,
        key: &PartitionKey,
    ) -> Result<Vec<ForecastRecord>, StoreError> {
        let rows_key = Self::object_key(StoreStage::Transformed, key, TRANSFORMED_FILE);
        let bytes = self.objects.get(&rows_key).await?;
        decode_lines(&rows_key, &bytes)
    }

    pub async fn read_transform_report<R: DeserializeOwned>(
        &self,
        key: &PartitionKey,
    ) -> Result<R, StoreError> {
        let report_key = Self::object_key(StoreStage::Transformed, key, TRANSFORM_REPORT_FILE);
        let bytes = self.objects.get(&report_key).await?;
        decode_json(&report_key, &bytes)
    }

    pub async fn clear(&self, stage: StoreStage, key: &PartitionKey) -> Result<usize, StoreError> {
        self.objects.delete_prefix(&Self::prefix(stage, key)).await
    }

    /// Whether the stage holds a complete artifact for `key`.
    pub async fn has(&self, stage: StoreStage, key: &PartitionKey) -> Result<bool, StoreError> {
        let marker = match stage {
            StoreStage::Raw => RAW_MANIFEST_FILE,
            StoreStage::Transformed => TRANSFORMED_FILE,
        };
        let wanted = Self::object_key(stage, key, marker);
        let keys = self.objects.list(&Self::prefix(stage, key)).await?;
        Ok(keys.iter().any(|k| *k == wanted))
    }
}
