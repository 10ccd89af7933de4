//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::config::Config;

pub fn cmd_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load_from(path);
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Init { force } => {
            init(path, force)?;
            eprintln!("Wrote {}", path.display());
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load_from(path);
            config.set(&key, &value)?;
            config.save_to(path)?;
            eprintln!("Set {key} = {value}");
        }
        ConfigAction::Unset { key } => {
            let mut config = Config::load_from(path);
            config.unset(&key)?;
            config.save_to(path)?;
            eprintln!("Reset {key}");
        }
    }
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        );
    }
    Config::default().save_to(path)
}
