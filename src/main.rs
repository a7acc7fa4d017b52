//! labctl daemon.
//!
//! Loads the configuration, starts one polling task per configured
//! instrument and logs a JSON snapshot of every channel at a fixed cadence
//! until Ctrl-C.
//!
//! ```bash
//! labctl --config config/labctl.toml --report-interval-ms 5000
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use labctl::config::{Config, DEFAULT_CONFIG_PATH};
use labctl::{logging, Subsystem};
use labctl_core::serial::SerialPortOpener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "labctl")]
#[command(about = "Serial instrument polling daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// How often to log a snapshot of every channel (0 disables)
    #[arg(long, default_value = "10000")]
    report_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init_from_config(&config)?;
    info!(config = %cli.config.display(), "labctl starting");

    let subsystem = Subsystem::start(&config, Arc::new(SerialPortOpener)).await;
    let snapshot = subsystem.snapshot();

    let reporter = (cli.report_interval_ms > 0).then(|| {
        let period = Duration::from_millis(cli.report_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match serde_json::to_string(&snapshot.snapshot()) {
                    Ok(json) => info!(target: "labctl::snapshot", snapshot = %json),
                    Err(e) => error!(error = %e, "failed to serialize snapshot"),
                }
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    subsystem.shutdown().await;
    Ok(())
}
