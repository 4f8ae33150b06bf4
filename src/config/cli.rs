use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "restock-monitor")]
#[command(about = "Watches product pages and notifies when items come back in stock")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "restock.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit structured JSON logs
    #[arg(long)]
    pub json: bool,

    /// Run a single pass and exit
    #[arg(long, conflicts_with = "interval")]
    pub once: bool,

    /// Seconds between runs, overrides monitor.interval_seconds
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,

    /// Show what would be checked without fetching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Log CPU and memory stats around each run
    #[arg(long)]
    pub monitor: bool,
}

impl CliArgs {
    pub fn interval_override(&self) -> Option<Duration> {
        self.interval.map(Duration::from_secs)
    }
}
