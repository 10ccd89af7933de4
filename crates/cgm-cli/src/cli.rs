//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use cgm_core::TransmitterKind;

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

impl OutputFormat {
    /// Parse a format name stored in the config file.
    pub fn from_config(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

/// Transmitter selection shared by commands that connect
#[derive(Debug, Clone, Args)]
pub struct TransmitterArgs {
    /// Transmitter family (blucon, miaomiao, dexcom-g7)
    #[arg(short, long, value_parser = parse_kind, env = "CGM_KIND")]
    pub kind: Option<TransmitterKind>,

    /// Advertised name or name fragment, or use CGM_DEVICE env var
    #[arg(short, long, visible_alias = "id", env = "CGM_DEVICE")]
    pub device: Option<String>,
}

fn parse_kind(value: &str) -> Result<TransmitterKind, String> {
    value.parse()
}

#[derive(Debug, Parser)]
#[command(name = "cgm")]
#[command(author, version, about = "CLI for BLE continuous glucose monitor transmitters", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan for nearby CGM transmitters
    Scan {
        /// Scan timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Show every peripheral, not only recognized transmitters
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Connect to a transmitter and print readings as they arrive
    Watch {
        #[command(flatten)]
        transmitter: TransmitterArgs,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Stop after one connection cycle
        #[arg(long)]
        once: bool,
    },

    /// Manage CLI configuration (prints it when no action is given)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Set one value
    Set {
        /// Key, e.g. `kind`, `device` or `transmitter.poll_interval_secs`
        key: String,
        /// New value
        value: String,
    },
    /// Reset one value to its default
    Unset {
        /// Key to reset
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_watch_args() {
        let cli = Cli::try_parse_from(["cgm", "watch", "--kind", "blucon", "-d", "BLU12345", "--once"])
            .unwrap();
        match cli.command {
            Commands::Watch {
                transmitter,
                format,
                once,
            } => {
                assert_eq!(transmitter.kind, Some(TransmitterKind::Blucon));
                assert_eq!(transmitter.device.as_deref(), Some("BLU12345"));
                assert_eq!(format, None);
                assert!(once);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_id_is_an_alias_for_device() {
        let cli = Cli::try_parse_from(["cgm", "watch", "--id", "DXCM99"]).unwrap();
        let Commands::Watch { transmitter, .. } = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(transmitter.device.as_deref(), Some("DXCM99"));
    }

    #[test]
    fn test_config_action_is_optional() {
        let cli = Cli::try_parse_from(["cgm", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { action: None }));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(Cli::try_parse_from(["cgm", "watch", "--kind", "libre3"]).is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["cgm", "-q", "-v", "scan"]).is_err());
    }

    #[test]
    fn test_format_from_config() {
        assert_eq!(OutputFormat::from_config("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_config("csv"), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::from_config("xml"), None);
    }
}
