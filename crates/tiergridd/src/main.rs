//! tiergridd — the TierGrid command-line driver.
//!
//! Loads a `tiergrid.toml`, and either prints the resolved settings or
//! drives a pool against the simulated host driver:
//! - Config check (parse, resolve, validate)
//! - Simulated resizes, one JSON report per step
//! - Optional autoscaler run against the same pool
//!
//! # Usage
//!
//! ```text
//! tiergridd check-config --config tiergrid.toml
//! tiergridd simulate --config tiergrid.toml --resize 10 --resize 3 --resize 0
//! ```

mod simulate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use tiergrid_core::TierGridConfig;

use crate::simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "tiergridd", about = "TierGrid two-tier pool driver")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a config file, then print the resolved settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Run resizes against an in-memory pool and print each report.
    Simulate {
        /// Config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target container count; repeat for several steps.
        #[arg(long = "resize", required = true, allow_negative_numbers = true)]
        resize: Vec<i64>,

        /// Simulated latency of every host launch and stop, in milliseconds.
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Refuse machine launches beyond this many running machines.
        #[arg(long)]
        machine_limit: Option<usize>,

        /// Make container launches fail on the machine at this index.
        #[arg(long = "fail-machine")]
        fail_machine: Vec<usize>,

        /// Report this CPU usage for every container.
        #[arg(long)]
        cpu: Option<f64>,

        /// After the resizes, run the `[autoscale]` policy for this many seconds.
        #[arg(long)]
        autoscale_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tiergrid=debug".parse().unwrap());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Command::CheckConfig { config } => check_config(&config),
        Command::Simulate {
            config,
            resize,
            latency_ms,
            machine_limit,
            fail_machine,
            cpu,
            autoscale_secs,
        } => {
            let config = match config {
                Some(path) => TierGridConfig::from_file(&path)?,
                None => TierGridConfig::default(),
            };
            simulate::run(
                &config,
                SimulateArgs {
                    targets: resize,
                    latency_ms,
                    machine_limit,
                    fail_machines: fail_machine,
                    cpu,
                    autoscale_secs,
                },
            )
            .await
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = TierGridConfig::from_file(path)?;
    let pool = config.pool_settings()?;
    let autoscale = config.autoscale_settings()?;
    info!(path = %path.display(), pool = %pool.name, "config is valid");

    let resolved = json!({
        "pool": pool,
        "autoscale": autoscale,
    });
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}
