use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ErrorKind;
use crate::models::{PartitionKey, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    /// The stage failed with an error that will not go away on retry.
    NonRetryable,
    /// Transient failures outlasted the retry policy.
    RetriesExhausted,
}

/// Operator-facing notice that a partition needs intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub partition: PartitionKey,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub reason: AlertReason,
    pub attempts: u32,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Emits alerts on the `forecast_pipeline::alert` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: Alert) {
        error!(
            target: "forecast_pipeline::alert",
            partition = %alert.partition,
            stage = %alert.stage,
            kind = %alert.kind,
            reason = ?alert.reason,
            attempts = alert.attempts,
            "partition requires intervention: {}",
            alert.message
        );
    }
}
