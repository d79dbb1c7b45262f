//! CLI entry point for irq-relay
//!
//! # Usage
//!
//! Relay a file, flushing one chunk per timer event:
//! ```bash
//! irq-relay run --config config/relay.toml --input data.bin --sort time --stats
//! ```
//!
//! Check a configuration file:
//! ```bash
//! irq-relay check --config config/relay.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use irq_relay::app::{self, RunOptions};
use irq_relay::config::RelayConfig;
use irq_relay::logging;
use relay_core::LogSortKey;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "irq-relay")]
#[command(about = "Event-triggered delayed data relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay input bytes to the configured destination
    Run {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: PathBuf,

        /// File whose contents are written into the device
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Keep writing until the device has accepted all input
        #[arg(long)]
        block: bool,

        /// Order of the merged log dump (type, time, count)
        #[arg(long, default_value = "type")]
        sort: LogSortKey,

        /// Print counter statistics as JSON after the logs
        #[arg(long)]
        stats: bool,
    },

    /// Load and validate a configuration, then print it
    Check {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            block,
            sort,
            stats,
        } => {
            let config = load_config(&config)?;
            logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

            let options = RunOptions { input, block, sort };
            run(&config, &options, stats).await
        }
        Commands::Check { config } => {
            let config = load_config(&config)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    let config = RelayConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

async fn run(config: &RelayConfig, options: &RunOptions, print_stats: bool) -> Result<()> {
    let report = app::run(config, options).await?;

    for entry in &report.logs {
        println!("{}", entry);
    }

    if print_stats {
        let stats = serde_json::to_string_pretty(&report.stats)
            .context("Failed to serialize statistics")?;
        println!("{}", stats);
    }

    if report.interrupted {
        eprintln!("Interrupted; {} bytes drained on close", report.drained);
    }
    Ok(())
}
