use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Classify, ErrorKind, PipelineError, Result};
use crate::utils::constants::MAX_ATTEMPT_HISTORY;

/// Width of the time window a partition covers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    #[default]
    Hourly,
}

impl Granularity {
    pub fn step(self) -> TimeDelta {
        match self {
            Granularity::Daily => TimeDelta::days(1),
            Granularity::Hourly => TimeDelta::hours(1),
        }
    }
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Partition identifier: `YYYY-MM-DD` for daily windows, `YYYY-MM-DDTHH` for hourly ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey {
    start: DateTime<Utc>,
    granularity: Granularity,
}

impl PartitionKey {
    /// Key of the window of the given granularity that contains `t`.
    pub fn for_time(t: DateTime<Utc>, granularity: Granularity) -> Self {
        let midnight = t.date_naive().and_time(NaiveTime::MIN).and_utc();
        let start = match granularity {
            Granularity::Daily => midnight,
            Granularity::Hourly => midnight + TimeDelta::hours(i64::from(t.hour())),
        };
        Self { start, granularity }
    }

    pub fn daily(date: NaiveDate) -> Self {
        Self {
            start: date.and_time(NaiveTime::MIN).and_utc(),
            granularity: Granularity::Daily,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidPartitionKey(s.to_string());
        let (date_part, hour_part) = match s.split_once('T') {
            Some((date, hour)) => (date, Some(hour)),
            None => (s, None),
        };

        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| invalid())?;
        if date_part.len() != 10 {
            return Err(invalid());
        }

        match hour_part {
            None => Ok(Self::daily(date)),
            Some(hour) => {
                if hour.len() != 2 {
                    return Err(invalid());
                }
                let hour: i64 = hour.parse().map_err(|_| invalid())?;
                if !(0..24).contains(&hour) {
                    return Err(invalid());
                }
                Ok(Self {
                    start: date.and_time(NaiveTime::MIN).and_utc() + TimeDelta::hours(hour),
                    granularity: Granularity::Hourly,
                })
            }
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.start + self.granularity.step())
    }

    pub fn next(&self) -> Self {
        Self {
            start: self.start + self.granularity.step(),
            granularity: self.granularity,
        }
    }

    /// All keys from `from` through `to` inclusive, at `from`'s granularity.
    pub fn range(from: &PartitionKey, to: &PartitionKey) -> Vec<PartitionKey> {
        let mut keys = Vec::new();
        let mut current = from.clone();
        while current.start <= to.start {
            keys.push(current.clone());
            current = current.next();
        }
        keys
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            Granularity::Daily => write!(f, "{}", self.start.format("%Y-%m-%d")),
            Granularity::Hourly => write!(f, "{}", self.start.format("%Y-%m-%dT%H")),
        }
    }
}

impl FromStr for PartitionKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.to_string()
    }
}

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn in_progress_status(self) -> PartitionStatus {
        match self {
            Stage::Extract => PartitionStatus::Extracting,
            Stage::Transform => PartitionStatus::Transforming,
            Stage::Load => PartitionStatus::Loading,
        }
    }

    pub fn completed_status(self) -> PartitionStatus {
        match self {
            Stage::Extract => PartitionStatus::Extracted,
            Stage::Transform => PartitionStatus::Transformed,
            Stage::Load => PartitionStatus::Loaded,
        }
    }

    /// Stage that moves a partition forward from a settled status.
    pub fn next_for(status: PartitionStatus) -> Option<Stage> {
        match status {
            PartitionStatus::Pending => Some(Stage::Extract),
            PartitionStatus::Extracted => Some(Stage::Transform),
            PartitionStatus::Transformed => Some(Stage::Load),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Pending,
    Extracting,
    Extracted,
    Transforming,
    Transformed,
    Loading,
    Loaded,
    Failed,
}

impl PartitionStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            PartitionStatus::Extracting | PartitionStatus::Transforming | PartitionStatus::Loading
        )
    }

    /// Settled status a partition falls back to when this one is interrupted.
    pub fn last_known_good(self) -> PartitionStatus {
        match self {
            PartitionStatus::Extracting => PartitionStatus::Pending,
            PartitionStatus::Transforming => PartitionStatus::Extracted,
            PartitionStatus::Loading => PartitionStatus::Transformed,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionStatus::Pending => "pending",
            PartitionStatus::Extracting => "extracting",
            PartitionStatus::Extracted => "extracted",
            PartitionStatus::Transforming => "transforming",
            PartitionStatus::Transformed => "transformed",
            PartitionStatus::Loading => "loading",
            PartitionStatus::Loaded => "loaded",
            PartitionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error that ended a stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl StageFailure {
    pub fn from_error<E: Classify + fmt::Display>(stage: Stage, err: &E, at: DateTime<Utc>) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            at,
        }
    }

    pub fn timeout(stage: Stage, limit: std::time::Duration, at: DateTime<Utc>) -> Self {
        Self {
            stage,
            kind: ErrorKind::TransientInfra,
            message: format!("{stage} stage cancelled after {}s timeout", limit.as_secs_f64()),
            retryable: true,
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { records: usize },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// One row of the persisted partition state table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub key: PartitionKey,
    pub status: PartitionStatus,
    /// Last settled status reached; a failed partition resumes from here.
    pub last_good: PartitionStatus,
    pub record_count: usize,
    /// Attempts made by the stage named in `attempt_stage`.
    pub attempts: u32,
    pub attempt_stage: Option<Stage>,
    pub total_attempts: u64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<StageFailure>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl PartitionRecord {
    pub fn new(key: PartitionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: PartitionStatus::Pending,
            last_good: PartitionStatus::Pending,
            record_count: 0,
            attempts: 0,
            attempt_stage: None,
            total_attempts: 0,
            created_at: now,
            last_attempt_at: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    /// Enter `stage`'s in-progress status and count the attempt.
    ///
    /// The per-stage counter only resets when a different stage starts, so a
    /// stage that was mid-retry keeps its count across process restarts.
    pub fn begin_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        if self.attempt_stage != Some(stage) {
            self.attempt_stage = Some(stage);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.total_attempts += 1;
        self.status = stage.in_progress_status();
        self.last_attempt_at = Some(now);
    }

    pub fn complete_stage(
        &mut self,
        stage: Stage,
        records: usize,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        self.status = stage.completed_status();
        self.last_good = self.status;
        self.record_count = records;
        self.last_error = None;
        self.push_history(AttemptRecord {
            stage,
            attempt: self.attempts,
            started_at,
            finished_at,
            outcome: AttemptOutcome::Succeeded { records },
        });
    }

    /// Record a failed attempt that will be retried.
    pub fn fail_attempt(&mut self, failure: StageFailure, started_at: DateTime<Utc>) {
        self.status = self.last_good;
        self.record_failure(failure, started_at);
    }

    /// Record the failure that ends the run and park the partition in `Failed`.
    pub fn mark_failed(&mut self, failure: StageFailure, started_at: DateTime<Utc>) {
        self.status = PartitionStatus::Failed;
        self.record_failure(failure, started_at);
    }

    /// Revert an interrupted in-progress status. Returns true if anything changed.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status.is_in_progress() {
            self.status = self.status.last_known_good();
            self.last_good = self.status;
            true
        } else {
            false
        }
    }

    /// Restart a loaded partition from scratch (forced rerun / backfill).
    pub fn reset_for_rerun(&mut self) {
        self.status = PartitionStatus::Pending;
        self.last_good = PartitionStatus::Pending;
        self.attempts = 0;
        self.attempt_stage = None;
        self.last_error = None;
    }

    /// Resume a failed partition from its last settled status with a fresh counter.
    pub fn resume_failed(&mut self) {
        self.status = self.last_good;
        self.attempts = 0;
        self.attempt_stage = None;
    }

    fn record_failure(&mut self, failure: StageFailure, started_at: DateTime<Utc>) {
        self.push_history(AttemptRecord {
            stage: failure.stage,
            attempt: self.attempts,
            started_at,
            finished_at: failure.at,
            outcome: AttemptOutcome::Failed {
                kind: failure.kind,
                message: failure.message.clone(),
            },
        });
        self.last_error = Some(failure);
    }

    fn push_history(&mut self, attempt: AttemptRecord) {
        self.history.push(attempt);
        if self.history.len() > MAX_ATTEMPT_HISTORY {
            let excess = self.history.len() - MAX_ATTEMPT_HISTORY;
            self.history.drain(..excess);
        }
    }
}
