//! Command-line interface for BLE continuous glucose monitor transmitters.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scan` | List nearby Libre bridges and Dexcom transmitters |
//! | `watch` | Connect and print readings as they arrive |
//! | `config` | Manage CLI configuration |
//!
//! # Configuration
//!
//! Settings live in `~/.config/cgm/config.toml` (or platform equivalent).
//! The `[transmitter]` table holds the transmitter family, its name and
//! the link and reconciliation timings. `--kind` and `--device` (or
//! `CGM_KIND` and `CGM_DEVICE`) override it for one run.
//!
//! # Examples
//!
//! ```bash
//! cgm scan --timeout 20
//! cgm watch --kind blucon --device BLU12345
//! cgm watch --kind dexcom-g7 --format csv --output readings.csv
//! cgm watch --kind dexcom-g6 --device 8G1234
//! cgm config set transmitter.poll_interval_secs 300
//! ```

mod cli;
mod commands;
mod config;
mod format;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConfigAction};
use crate::commands::{WatchArgs, cmd_config, cmd_scan, cmd_watch};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // readings go to stdout, everything else to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();
    let output = cli.output.as_ref();

    match cli.command {
        Commands::Scan {
            timeout,
            all,
            format,
        } => {
            cmd_scan(timeout, all, config.resolve_format(format), output, cli.quiet).await?;
        }
        Commands::Watch {
            transmitter,
            format,
            once,
        } => {
            cmd_watch(WatchArgs {
                transmitter: config.resolve_transmitter(transmitter.kind, transmitter.device),
                format: config.resolve_format(format),
                output,
                once,
                quiet: cli.quiet,
            })
            .await?;
        }
        Commands::Config { action } => {
            cmd_config(action.unwrap_or(ConfigAction::Show), &Config::path())?;
        }
    }

    Ok(())
}
