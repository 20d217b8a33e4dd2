use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::alert::{Alert, AlertReason, AlertSink};
use super::retry::{RetryDecision, RetryPolicy};
use super::state_table::StateTable;
use crate::config::OrchestratorSettings;
use crate::error::{ErrorKind, PipelineError, Result, StageError, StateError};
use crate::extract::Extractor;
use crate::models::{
    ForecastRecord, Granularity, PartitionKey, PartitionRecord, PartitionStatus, Stage,
    StageFailure,
};
use crate::store::{PartitionStore, StoreStage};
use crate::transform::TransformEngine;
use crate::utils::ProgressReporter;
use crate::warehouse::Loader;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub granularity: Granularity,
    pub worker_concurrency: usize,
    pub stage_timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: &OrchestratorSettings) -> Self {
        Self {
            granularity: settings.granularity,
            worker_concurrency: settings.worker_concurrency,
            stage_timeout: Duration::from_secs(settings.stage_timeout_secs),
            retry: RetryPolicy::from(&settings.retry),
        }
    }
}

/// How a call to [`Orchestrator::run`] ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Loaded { record_count: usize, attempts: u32 },
    /// Already loaded and not forced.
    AlreadyLoaded,
    /// Another run holds the partition.
    AlreadyRunning,
    Failed {
        stage: Stage,
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
    /// Parked in `Failed`; needs a forced rerun or purge.
    RequiresIntervention,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Loaded {
                record_count,
                attempts,
            } => write!(f, "loaded {record_count} rows (load attempts: {attempts})"),
            RunOutcome::AlreadyLoaded => f.write_str("already loaded"),
            RunOutcome::AlreadyRunning => f.write_str("already running"),
            RunOutcome::Failed {
                stage,
                kind,
                attempts,
                message,
            } => write!(f, "failed in {stage} after {attempts} attempt(s) [{kind}]: {message}"),
            RunOutcome::RequiresIntervention => {
                f.write_str("failed earlier; rerun with --force or purge")
            }
        }
    }
}

/// What `purge` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub state_removed: bool,
    pub raw_objects: usize,
    pub transformed_objects: usize,
    pub warehouse_rows: usize,
}

struct Inner {
    extractor: Extractor,
    transform: TransformEngine,
    loader: Loader,
    store: PartitionStore,
    state: StateTable,
    alerts: Arc<dyn AlertSink>,
    config: OrchestratorConfig,
    workers: Arc<Semaphore>,
    locks: Arc<PartitionLocks>,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Non-blocking per-partition locks. An entry lives only while some run holds
/// or is acquiring it.
#[derive(Default)]
struct PartitionLocks {
    locks: Mutex<HashMap<PartitionKey, KeyLock>>,
}

impl PartitionLocks {
    fn try_lock(this: &Arc<Self>, key: &PartitionKey) -> Option<PartitionGuard> {
        let lock = {
            let mut locks = this.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.clone()).or_default().clone()
        };
        match lock.try_lock_owned() {
            Ok(guard) => Some(PartitionGuard {
                guard: Some(guard),
                key: key.clone(),
                locks: this.clone(),
            }),
            Err(_) => {
                this.prune(key);
                None
            }
        }
    }

    fn prune(&self, key: &PartitionKey) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under this lock, so a count of one means idle
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct PartitionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: PartitionKey,
    locks: Arc<PartitionLocks>,
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.key);
    }
}

/// Drives partitions through extract, transform and load.
///
/// The only writer of the state table. At most one run per partition key is
/// active at a time; distinct partitions share a bounded worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        extractor: Extractor,
        transform: TransformEngine,
        loader: Loader,
        store: PartitionStore,
        state: StateTable,
        alerts: Arc<dyn AlertSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                extractor,
                transform,
                loader,
                store,
                state,
                alerts,
                config,
                workers,
                locks: Arc::new(PartitionLocks::default()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    /// Register the partition whose window contains `now`. Calling it again is harmless.
    pub async fn schedule(&self, now: DateTime<Utc>) -> Result<PartitionKey> {
        let key = PartitionKey::for_time(now, self.inner.config.granularity);
        let (_, created) = self.inner.state.get_or_insert(&key, now).await?;
        if created {
            info!(partition = %key, "scheduled partition");
        }
        Ok(key)
    }

    pub async fn status(&self, key: &PartitionKey) -> Option<PartitionRecord> {
        self.inner.state.get(key).await
    }

    pub async fn list(&self) -> Vec<PartitionRecord> {
        self.inner.state.list().await
    }

    pub async fn pending(&self) -> Vec<PartitionKey> {
        self.inner.state.pending().await
    }

    fn try_lock(&self, key: &PartitionKey) -> Option<PartitionGuard> {
        PartitionLocks::try_lock(&self.inner.locks, key)
    }

    /// Drive `key` to `Loaded` or `Failed`, creating it if unknown.
    ///
    /// A loaded partition is left alone unless `force` is set, in which case it
    /// restarts from `Pending`. A forced rerun of a failed partition resumes from
    /// its last settled status.
    pub async fn run(&self, key: &PartitionKey, force: bool) -> Result<RunOutcome> {
        let Some(_guard) = self.try_lock(key) else {
            debug!(partition = %key, "run skipped, partition busy");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let _permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)?;

        let state = &self.inner.state;
        let (record, _) = state.get_or_insert(key, Utc::now()).await?;
        match record.status {
            PartitionStatus::Loaded if !force => return Ok(RunOutcome::AlreadyLoaded),
            PartitionStatus::Loaded => {
                info!(partition = %key, "forced rerun of loaded partition");
                state.update(key, |r| r.reset_for_rerun()).await?;
            }
            PartitionStatus::Failed if !force => return Ok(RunOutcome::RequiresIntervention),
            PartitionStatus::Failed => {
                info!(partition = %key, from = %record.last_good, "resuming failed partition");
                state.update(key, |r| r.resume_failed()).await?;
            }
            status if status.is_in_progress() => {
                warn!(partition = %key, status = %status, "reverting stale in-progress status");
                state.update(key, |r| r.recover_interrupted()).await?;
            }
            _ => {}
        }

        self.drive(key).await
    }

    async fn drive(&self, key: &PartitionKey) -> Result<RunOutcome> {
        let mut handoff: Option<Vec<ForecastRecord>> = None;
        loop {
            let record = self
                .inner
                .state
                .get(key)
                .await
                .ok_or_else(|| StateError::UnknownPartition(key.to_string()))?;

            if record.status == PartitionStatus::Loaded {
                return Ok(RunOutcome::Loaded {
                    record_count: record.record_count,
                    attempts: record.attempts,
                });
            }
            let Some(stage) = Stage::next_for(record.status) else {
                return Ok(RunOutcome::RequiresIntervention);
            };
            if let Some(outcome) = self.run_stage(key, stage, &mut handoff).await? {
                return Ok(outcome);
            }
        }
    }

    /// Attempt `stage` until it succeeds (`None`) or the policy gives up.
    async fn run_stage(
        &self,
        key: &PartitionKey,
        stage: Stage,
        handoff: &mut Option<Vec<ForecastRecord>>,
    ) -> Result<Option<RunOutcome>> {
        let state = &self.inner.state;
        let limit = self.inner.config.stage_timeout;
        let policy = self.inner.config.retry;

        loop {
            let started_at = Utc::now();
            let (record, _) = state.update(key, |r| r.begin_stage(stage, started_at)).await?;
            let attempt = record.attempts;
            debug!(partition = %key, stage = %stage, attempt, "stage attempt started");

            let result = tokio::time::timeout(limit, self.invoke(key, stage, handoff)).await;
            let finished_at = Utc::now();
            let failure = match result {
                Ok(Ok(records)) => {
                    state
                        .update(key, |r| r.complete_stage(stage, records, started_at, finished_at))
                        .await?;
                    info!(partition = %key, stage = %stage, attempt, records, "stage completed");
                    return Ok(None);
                }
                Ok(Err(err)) => StageFailure::from_error(stage, &err, finished_at),
                Err(_) => StageFailure::timeout(stage, limit, finished_at),
            };

            match policy.decide(attempt, failure.retryable) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        partition = %key,
                        stage = %stage,
                        attempt,
                        kind = %failure.kind,
                        delay_ms = delay.as_millis() as u64,
                        "stage attempt failed, retrying: {}",
                        failure.message
                    );
                    state.update(key, |r| r.fail_attempt(failure, started_at)).await?;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    let reason = if failure.retryable {
                        AlertReason::RetriesExhausted
                    } else {
                        AlertReason::NonRetryable
                    };
                    let outcome = RunOutcome::Failed {
                        stage,
                        kind: failure.kind,
                        attempts: attempt,
                        message: failure.message.clone(),
                    };
                    let alert = Alert {
                        partition: key.clone(),
                        stage,
                        kind: failure.kind,
                        reason,
                        attempts: attempt,
                        message: failure.message.clone(),
                        raised_at: failure.at,
                    };
                    state.update(key, |r| r.mark_failed(failure, started_at)).await?;
                    self.inner.alerts.raise(alert).await;
                    return Ok(Some(outcome));
                }
            }
        }
    }

    /// One stage invocation. Returns the record count the stage produced.
    async fn invoke(
        &self,
        key: &PartitionKey,
        stage: Stage,
        handoff: &mut Option<Vec<ForecastRecord>>,
    ) -> std::result::Result<usize, StageError> {
        match stage {
            Stage::Extract => {
                *handoff = None;
                let batch = self.inner.extractor.extract(key, key.window()).await?;
                Ok(batch.records.len())
            }
            Stage::Transform => {
                let batch = self.inner.transform.transform(key).await?;
                let kept = batch.rows.len();
                *handoff = Some(batch.rows);
                Ok(kept)
            }
            Stage::Load => {
                let loaded = match handoff.as_deref() {
                    Some(rows) => self.inner.loader.load(key, rows).await?,
                    None => self.inner.loader.load_from_store(key).await?,
                };
                Ok(loaded.rows_written)
            }
        }
    }

    /// Run several partitions concurrently, bounded by the worker pool.
    pub async fn run_many(
        &self,
        keys: Vec<PartitionKey>,
        force: bool,
        progress: Option<&ProgressReporter>,
    ) -> Vec<(PartitionKey, Result<RunOutcome>)> {
        let mut tasks = JoinSet::new();
        for key in keys {
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let outcome = orchestrator.run(&key, force).await;
                (key, outcome)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, outcome)) => {
                    if let Some(progress) = progress {
                        progress.increment(1);
                        progress.set_message(&format!("{key}"));
                    }
                    results.push((key, outcome));
                }
                Err(e) => error!("partition run task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Remove every trace of `key`: state row, stored artifacts and warehouse rows.
    pub async fn purge(&self, key: &PartitionKey) -> Result<PurgeSummary> {
        let Some(_guard) = self.try_lock(key) else {
            return Err(PipelineError::PartitionBusy(key.to_string()));
        };

        let warehouse_rows = self.inner.loader.purge(key).await?;
        let raw_objects = self.inner.store.clear(StoreStage::Raw, key).await?;
        let transformed_objects = self.inner.store.clear(StoreStage::Transformed, key).await?;
        let state_removed = self.inner.state.remove(key).await?.is_some();

        let summary = PurgeSummary {
            state_removed,
            raw_objects,
            transformed_objects,
            warehouse_rows,
        };
        info!(partition = %key, ?summary, "partition purged");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = OrchestratorSettings {
            worker_concurrency: 3,
            stage_timeout_secs: 12,
            ..OrchestratorSettings::default()
        };
        let config = OrchestratorConfig::from(&settings);
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.stage_timeout, Duration::from_secs(12));
        assert_eq!(config.retry, RetryPolicy::from(&settings.retry));
    }

    #[test]
    fn test_partition_locks_are_exclusive_and_pruned() {
        let locks = Arc::new(PartitionLocks::default());
        let day = PartitionKey::parse("2024-06-01").unwrap();
        let next = PartitionKey::parse("2024-06-02").unwrap();

        let held = PartitionLocks::try_lock(&locks, &day).unwrap();
        assert!(PartitionLocks::try_lock(&locks, &day).is_none());
        let other = PartitionLocks::try_lock(&locks, &next).unwrap();
        assert_eq!(locks.len(), 2);

        drop(held);
        assert_eq!(locks.len(), 1);
        let again = PartitionLocks::try_lock(&locks, &day).unwrap();
        drop(again);
        drop(other);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RunOutcome::Loaded {
            record_count: 97,
            attempts: 1,
        })
        .unwrap();
        assert_eq!(json["outcome"], "loaded");
        assert_eq!(json["record_count"], 97);
        assert_eq!(RunOutcome::AlreadyLoaded.to_string(), "already loaded");
    }
}
