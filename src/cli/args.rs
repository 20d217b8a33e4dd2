use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forecast-pipeline")]
#[command(about = "Hourly weather-forecast ingestion pipeline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Settings file (TOML)")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Schedule and run partitions on the configured cadence until Ctrl-C
    Serve {
        #[arg(long, help = "Run a single tick and exit")]
        once: bool,
    },

    /// Run one partition through extract, transform and load
    Run {
        #[arg(help = "Partition key: YYYY-MM-DD or YYYY-MM-DDTHH")]
        partition: String,

        #[arg(long, help = "Rerun even if already loaded or failed")]
        force: bool,
    },

    /// Run every partition in an inclusive key range
    Backfill {
        #[arg(long, help = "First partition key")]
        from: String,

        #[arg(long, help = "Last partition key (inclusive)")]
        to: String,

        #[arg(long)]
        force: bool,
    },

    /// Show partition state
    Status {
        #[arg(help = "Partition key [default: all partitions]")]
        partition: Option<String>,

        #[arg(long, help = "Print attempt history")]
        history: bool,

        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,
    },

    /// Delete a partition's state, stored artifacts and warehouse rows
    Purge {
        partition: String,
    },

    /// Query loaded forecasts
    Query {
        #[arg(short, long, default_value = "temperature")]
        metric: String,

        #[arg(short, long)]
        location: Option<String>,

        #[arg(long, help = "Start of range (RFC 3339 or YYYY-MM-DD HH:MM)")]
        from: Option<String>,

        #[arg(long, help = "End of range, exclusive")]
        to: Option<String>,

        #[arg(long, help = "Aggregate per location and day")]
        daily: bool,

        #[arg(short, long, help = "Write CSV to this path")]
        output: Option<PathBuf>,

        #[arg(long, default_value = "20", help = "Rows to print (0 = all)")]
        limit: usize,
    },

    /// Summarize the warehouse table
    Info {
        #[arg(short, long, help = "Show Parquet details for a partition")]
        partition: Option<String>,
    },
}
