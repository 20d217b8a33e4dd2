use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::runner::{Orchestrator, RunOutcome};
use crate::error::Result;
use crate::models::PartitionKey;

/// Result of one scheduler tick.
#[derive(Debug)]
pub struct TickReport {
    pub scheduled: PartitionKey,
    pub outcomes: Vec<(PartitionKey, Result<RunOutcome>)>,
}

impl TickReport {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, Ok(RunOutcome::Loaded { .. })))
            .count()
    }
}

/// Creates a partition per cadence and works off everything still pending.
pub struct Scheduler {
    orchestrator: Orchestrator,
    cadence: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, cadence: Duration) -> Self {
        Self {
            orchestrator,
            cadence,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let scheduled = self.orchestrator.schedule(now).await?;
        let pending = self.orchestrator.pending().await;
        let outcomes = self.orchestrator.run_many(pending, false, None).await;
        Ok(TickReport {
            scheduled,
            outcomes,
        })
    }

    /// Tick on the cadence until `shutdown` resolves. The first tick fires immediately.
    ///
    /// Shutdown also interrupts a tick in flight; partitions it was running are
    /// left in-progress and reverted the next time the state table is opened.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(cadence_secs = self.cadence.as_secs(), "scheduler started");
        'ticks: loop {
            tokio::select! {
                _ = &mut shutdown => break 'ticks,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            warn!("shutdown requested during tick, abandoning in-flight runs");
                            break 'ticks;
                        }
                        result = self.tick(Utc::now()) => log_tick(result),
                    }
                }
            }
        }
        info!("scheduler stopping");
        Ok(())
    }
}

fn log_tick(result: Result<TickReport>) {
    match result {
        Ok(report) => {
            let failures = report.failures();
            if failures > 0 {
                warn!(
                    scheduled = %report.scheduled,
                    runs = report.outcomes.len(),
                    failures,
                    "tick finished with unloaded partitions"
                );
            } else {
                info!(
                    scheduled = %report.scheduled,
                    runs = report.outcomes.len(),
                    "tick finished"
                );
            }
        }
        Err(e) => error!("scheduler tick failed: {}", e),
    }
}
