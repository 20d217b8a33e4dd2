use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analyzers::{write_csv, ForecastAnalyzer, QueryFilter};
use crate::cli::args::{Cli, Commands};
use crate::config::Settings;
use crate::extract::{CircuitBreaker, Extractor, ExtractorConfig, HttpForecastProvider};
use crate::models::{Metric, PartitionKey, PartitionRecord};
use crate::orchestrator::{
    LogAlertSink, Orchestrator, OrchestratorConfig, RunOutcome, Scheduler, StateTable,
};
use crate::store::{LocalObjectStore, PartitionStore};
use crate::transform::{TransformConfig, TransformEngine};
use crate::utils::constants::BREAKER_FAILURE_THRESHOLD;
use crate::utils::{init_logging, parse_timestamp_str, ProgressReporter};
use crate::warehouse::{ConnectionPool, Loader, LoaderConfig, ParquetTable, ParquetWarehouse};

/// Open the warehouse without touching its files. Readers use this so they
/// never disturb a replace that a running pipeline has in flight.
pub fn open_warehouse(settings: &Settings) -> anyhow::Result<ParquetWarehouse> {
    let codec = ParquetTable::new()
        .with_compression(&settings.warehouse.compression)?
        .with_row_group_size(settings.warehouse.row_group_size);
    Ok(ParquetWarehouse::new(
        &settings.warehouse.root,
        settings.warehouse.table.clone(),
        codec,
    ))
}

/// Wire the pipeline from settings. Extraction commands pass `require_provider`
/// so missing credentials abort before any partition runs.
pub async fn build_orchestrator(
    settings: &Settings,
    require_provider: bool,
) -> anyhow::Result<Orchestrator> {
    if require_provider {
        settings.require_credentials()?;
    }

    let store = PartitionStore::new(Arc::new(LocalObjectStore::new(&settings.storage.root)));
    let breaker = Arc::new(CircuitBreaker::with_threshold(
        settings.provider.breaker_cooldown(),
        BREAKER_FAILURE_THRESHOLD,
    ));
    let provider = HttpForecastProvider::new(
        &settings.provider.base_url,
        settings.provider.api_key.clone().unwrap_or_default(),
        settings.provider.request_timeout(),
        breaker,
    )?;
    let extractor = Extractor::new(
        Arc::new(provider),
        store.clone(),
        ExtractorConfig::from(&settings.provider),
    );
    let transform = TransformEngine::new(store.clone(), TransformConfig::from(&settings.transform));

    let warehouse = open_warehouse(settings)?;
    let recovered = warehouse
        .recover_staging()
        .context("failed to clean up interrupted warehouse writes")?;
    if !recovered.is_empty() {
        warn!(partitions = ?recovered, "discarded interrupted warehouse writes");
    }
    let loader = Loader::new(
        Arc::new(warehouse),
        ConnectionPool::new(settings.warehouse.pool_size, settings.warehouse.acquire_timeout()),
        store.clone(),
        LoaderConfig::from(&settings.warehouse),
    );

    let state = StateTable::open(&settings.state.path)
        .await
        .with_context(|| format!("failed to open state table {}", settings.state.path.display()))?;

    Ok(Orchestrator::new(
        extractor,
        transform,
        loader,
        store,
        state,
        Arc::new(LogAlertSink),
        OrchestratorConfig::from(&settings.orchestrator),
    ))
}

fn parse_key(s: &str) -> anyhow::Result<PartitionKey> {
    PartitionKey::parse(s).with_context(|| format!("invalid partition key '{s}'"))
}

fn parse_time(s: Option<&str>, flag: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    match s {
        None => Ok(None),
        Some(raw) => parse_timestamp_str(raw)
            .map(Some)
            .with_context(|| format!("could not parse --{flag} '{raw}'")),
    }
}

fn print_record(record: &PartitionRecord, history: bool) {
    println!(
        "{:<14} {:<12} last_good={:<12} attempts={} total={} records={}",
        record.key.to_string(),
        record.status.to_string(),
        record.last_good.to_string(),
        record.attempts,
        record.total_attempts,
        record.record_count
    );
    if let Some(err) = &record.last_error {
        println!(
            "    last error [{}] in {} at {}: {}",
            err.kind,
            err.stage,
            err.at.to_rfc3339(),
            err.message
        );
    }
    if history {
        for attempt in &record.history {
            println!(
                "    {} #{} {} -> {}: {:?}",
                attempt.stage,
                attempt.attempt,
                attempt.started_at.to_rfc3339(),
                attempt.finished_at.to_rfc3339(),
                attempt.outcome
            );
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Commands::Serve { once } => {
            let orchestrator = build_orchestrator(&settings, true).await?;
            let scheduler = Scheduler::new(orchestrator, settings.orchestrator.cadence());
            if once {
                let report = scheduler.tick(Utc::now()).await?;
                for (key, outcome) in &report.outcomes {
                    match outcome {
                        Ok(outcome) => println!("{key}: {outcome}"),
                        Err(e) => println!("{key}: error: {e}"),
                    }
                }
            } else {
                scheduler
                    .run_until(async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!("failed to listen for Ctrl-C: {}", e);
                            std::future::pending::<()>().await;
                        }
                    })
                    .await?;
            }
        }

        Commands::Run { partition, force } => {
            let key = parse_key(&partition)?;
            let orchestrator = build_orchestrator(&settings, true).await?;
            let outcome = orchestrator.run(&key, force).await?;
            println!("{key}: {outcome}");
            if matches!(outcome, RunOutcome::Failed { .. }) {
                bail!("partition {key} failed");
            }
        }

        Commands::Backfill { from, to, force } => {
            let from = parse_key(&from)?;
            let to = parse_key(&to)?;
            if from.granularity() != to.granularity() {
                bail!("--from and --to must use the same granularity");
            }
            let keys = PartitionKey::range(&from, &to);
            if keys.is_empty() {
                bail!("empty range: {from} is after {to}");
            }

            let orchestrator = build_orchestrator(&settings, true).await?;
            info!(partitions = keys.len(), %from, %to, force, "starting backfill");
            let progress = ProgressReporter::new(keys.len() as u64, "Backfilling partitions", false);
            let results = orchestrator.run_many(keys, force, Some(&progress)).await;
            progress.finish_with_message("Backfill complete");

            let mut failed = 0;
            for (key, outcome) in &results {
                match outcome {
                    Ok(outcome) => {
                        if matches!(outcome, RunOutcome::Failed { .. } | RunOutcome::RequiresIntervention) {
                            failed += 1;
                        }
                        println!("{key}: {outcome}");
                    }
                    Err(e) => {
                        failed += 1;
                        println!("{key}: error: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} partitions did not load", results.len());
            }
        }

        Commands::Status {
            partition,
            history,
            json,
        } => {
            let mut records = StateTable::snapshot(&settings.state.path).await?;
            if let Some(raw) = partition {
                let key = parse_key(&raw)?;
                records.retain(|r| r.key == key);
                if records.is_empty() {
                    bail!("partition {key} is not tracked");
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No partitions tracked");
            } else {
                for record in &records {
                    print_record(record, history);
                }
            }
        }

        Commands::Purge { partition } => {
            let key = parse_key(&partition)?;
            let orchestrator = build_orchestrator(&settings, false).await?;
            let summary = orchestrator.purge(&key).await?;
            println!(
                "Purged {key}: state row {}, {} raw objects, {} transformed objects, {} warehouse rows",
                if summary.state_removed { "removed" } else { "absent" },
                summary.raw_objects,
                summary.transformed_objects,
                summary.warehouse_rows
            );
        }

        Commands::Query {
            metric,
            location,
            from,
            to,
            daily,
            output,
            limit,
        } => {
            let metric: Metric = metric.parse()?;
            let filter = QueryFilter {
                location,
                from: parse_time(from.as_deref(), "from")?,
                to: parse_time(to.as_deref(), "to")?,
            };
            let analyzer = ForecastAnalyzer::new(Arc::new(open_warehouse(&settings)?));
            let shown = |total: usize| if limit == 0 { total } else { limit.min(total) };

            if daily {
                let rows = analyzer.daily_aggregates(metric, &filter).await?;
                println!("Daily {} ({}), {} rows", metric, metric.units(), rows.len());
                for row in rows.iter().take(shown(rows.len())) {
                    let fmt = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{v:.1}"));
                    println!(
                        "{:<12} {} min={} max={} mean={} n={}",
                        row.location_id,
                        row.date,
                        fmt(row.min),
                        fmt(row.max),
                        fmt(row.mean),
                        row.count
                    );
                }
                if let Some(path) = output {
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    write_csv(&rows, BufWriter::new(file))?;
                    println!("Wrote {}", path.display());
                }
            } else {
                let points = analyzer.time_series(metric, &filter).await?;
                println!("{} ({}), {} points", metric, metric.units(), points.len());
                for point in points.iter().take(shown(points.len())) {
                    println!(
                        "{:<12} {} {}",
                        point.location_id,
                        point.forecast_time.to_rfc3339(),
                        point.value.map_or("-".to_string(), |v| format!("{v:.1}"))
                    );
                }
                if let Some(path) = output {
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    write_csv(&points, BufWriter::new(file))?;
                    println!("Wrote {}", path.display());
                }
            }
        }

        Commands::Info { partition } => {
            let warehouse = Arc::new(open_warehouse(&settings)?);
            let analyzer = ForecastAnalyzer::new(warehouse.clone());
            let summary = analyzer.summary().await?;
            println!("{}", summary.summary());

            if let Some(raw) = partition {
                let key = parse_key(&raw)?;
                match warehouse.file_info(&key)? {
                    Some(info) => {
                        println!("\nPartition {key}:");
                        println!("{}", info.summary());
                    }
                    None => println!("\nPartition {key} is not loaded"),
                }
            }
        }
    }

    Ok(())
}
