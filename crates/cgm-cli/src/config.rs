//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use cgm_core::{TransmitterConfig, TransmitterKind};
use cgm_core::config::TRANSMITTER_ID_LEN;

use crate::cli::OutputFormat;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Default output format
    #[serde(default)]
    pub format: Option<String>,

    /// Last transmitter a cycle completed with (auto-updated)
    #[serde(default)]
    pub last_device: Option<String>,

    /// Transmitter settings passed to the coordinator
    #[serde(default)]
    pub transmitter: TransmitterConfig,
}

impl Config {
    /// Get the config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cgm")
            .join("config.toml")
    }

    /// Load config from the default location, or return default if not found
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`; unreadable or invalid files fall back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config: {e}");
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config: {e}");
            }
        }
        Self::default()
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Output format from the flag, then the config, then text
    pub fn resolve_format(&self, flag: Option<OutputFormat>) -> OutputFormat {
        flag.or_else(|| self.format.as_deref().and_then(OutputFormat::from_config))
            .unwrap_or_default()
    }

    /// Transmitter settings with command-line overrides applied.
    ///
    /// Choosing a different family starts from that family's defaults, so
    /// wear time and spacing do not leak between transmitter types.
    pub fn resolve_transmitter(
        &self,
        kind: Option<TransmitterKind>,
        device: Option<String>,
    ) -> TransmitterConfig {
        let fresh = kind.filter(|k| *k != self.transmitter.kind);
        let mut config = fresh.map_or_else(|| self.transmitter.clone(), TransmitterConfig::new);
        if let Some(device) = device {
            config = match config.kind {
                // Stelo names select the longer wear time
                TransmitterKind::DexcomG7 if fresh.is_some() => TransmitterConfig::dexcom_g7(device),
                _ => config.with_transmitter_id(device),
            };
        }
        config
    }

    /// Set one value by key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let t = &mut self.transmitter;
        match key {
            "format" => {
                if OutputFormat::from_config(value).is_none() {
                    bail!("Invalid format '{value}'. Valid options: text, json, csv");
                }
                self.format = Some(value.to_lowercase());
            }
            "kind" | "transmitter.kind" => {
                t.kind = value.parse().map_err(anyhow::Error::msg)?;
            }
            "device" | "transmitter.transmitter_id" => t.transmitter_id = value.to_string(),
            "transmitter.max_sensor_age_days" => t.max_sensor_age_days = parse(key, value)?,
            "transmitter.sample_spacing_secs" => t.sample_spacing_secs = parse(key, value)?,
            "transmitter.dedupe_tolerance_secs" => t.dedupe_tolerance_secs = parse(key, value)?,
            "transmitter.max_resends" => t.max_resends = parse(key, value)?,
            "transmitter.cycle_timeout_secs" => t.cycle_timeout_secs = parse(key, value)?,
            "transmitter.poll_interval_secs" => t.poll_interval_secs = parse(key, value)?,
            "transmitter.rejection_cooldown_secs" => {
                t.rejection_cooldown_secs = parse(key, value)?;
            }
            _ => bail!("Unknown config key '{key}'"),
        }
        // the transmitter id may be set later
        let mut candidate = t.clone();
        if candidate.transmitter_id.is_empty() {
            candidate.transmitter_id = "?".repeat(TRANSMITTER_ID_LEN);
        }
        candidate
            .validate()
            .with_context(|| format!("Invalid value for {key}"))?;
        Ok(())
    }

    /// Reset one value to its default.
    pub fn unset(&mut self, key: &str) -> Result<()> {
        let defaults = TransmitterConfig::new(self.transmitter.kind);
        let t = &mut self.transmitter;
        match key {
            "format" => self.format = None,
            "last_device" => self.last_device = None,
            "device" | "transmitter.transmitter_id" => t.transmitter_id.clear(),
            "transmitter.max_sensor_age_days" => t.max_sensor_age_days = defaults.max_sensor_age_days,
            "transmitter.sample_spacing_secs" => t.sample_spacing_secs = defaults.sample_spacing_secs,
            "transmitter.dedupe_tolerance_secs" => {
                t.dedupe_tolerance_secs = defaults.dedupe_tolerance_secs;
            }
            "transmitter.max_resends" => t.max_resends = defaults.max_resends,
            "transmitter.cycle_timeout_secs" => t.cycle_timeout_secs = defaults.cycle_timeout_secs,
            "transmitter.poll_interval_secs" => t.poll_interval_secs = defaults.poll_interval_secs,
            "transmitter.rejection_cooldown_secs" => {
                t.rejection_cooldown_secs = defaults.rejection_cooldown_secs;
            }
            _ => bail!("Unknown config key '{key}'"),
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{value}' for {key}: {e}"))
}

/// Remember the transmitter a cycle completed with.
pub fn update_last_device(path: &Path, identifier: &str) -> Result<()> {
    let mut config = Config::load_from(path);
    if config.last_device.as_deref() == Some(identifier) {
        return Ok(());
    }
    config.last_device = Some(identifier.to_string());
    config.save_to(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.set("kind", "blucon").unwrap();
        config.set("device", "BLU12345").unwrap();
        config.set("format", "JSON").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.transmitter.kind, TransmitterKind::Blucon);
        assert_eq!(loaded.transmitter.transmitter_id, "BLU12345");
        assert_eq!(loaded.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "format = \"csv\"\n\n[transmitter]\nkind = \"miaomiao\"\npoll_interval_secs = 120\n",
        )
        .unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.resolve_format(None), OutputFormat::Csv);
        assert_eq!(config.transmitter.kind, TransmitterKind::MiaoMiao);
        assert_eq!(config.transmitter.poll_interval_secs, 120);
        assert_eq!(
            config.transmitter.sample_spacing_secs,
            TransmitterConfig::default().sample_spacing_secs
        );
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "format = [").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("format", "xml").is_err());
        assert!(config.set("kind", "libre3").is_err());
        assert!(config.set("transmitter.poll_interval_secs", "soon").is_err());
        assert!(config.set("transmitter.sample_spacing_secs", "0").is_err());
        assert!(config.set("colour", "red").is_err());
    }

    #[test]
    fn test_dexcom_kind_before_id() {
        let mut config = Config::default();
        config.set("kind", "dexcom-g6").unwrap();
        assert!(config.set("device", "8G12").is_err());
        config.set("device", "8G1234").unwrap();
        assert_eq!(config.transmitter.kind, TransmitterKind::DexcomG6);
    }

    #[test]
    fn test_unset_restores_default() {
        let mut config = Config::default();
        config.set("transmitter.max_resends", "7").unwrap();
        config.unset("transmitter.max_resends").unwrap();
        assert_eq!(
            config.transmitter.max_resends,
            TransmitterConfig::new(config.transmitter.kind).max_resends
        );
    }

    #[test]
    fn test_flag_overrides_config_format() {
        let config = Config {
            format: Some("json".into()),
            ..Default::default()
        };
        assert_eq!(config.resolve_format(Some(OutputFormat::Text)), OutputFormat::Text);
        assert_eq!(config.resolve_format(None), OutputFormat::Json);
    }

    #[test]
    fn test_resolve_transmitter_prefers_arguments() {
        let mut config = Config::default();
        config.set("kind", "miaomiao").unwrap();
        config.set("transmitter.poll_interval_secs", "120").unwrap();

        let same = config.resolve_transmitter(None, Some("miaomiao2".into()));
        assert_eq!(same.kind, TransmitterKind::MiaoMiao);
        assert_eq!(same.transmitter_id, "miaomiao2");
        assert_eq!(same.poll_interval_secs, 120);

        let other = config.resolve_transmitter(Some(TransmitterKind::DexcomG7), Some("DX01AB".into()));
        assert_eq!(other.kind, TransmitterKind::DexcomG7);
        assert_eq!(other.transmitter_id, "DX01AB");
        assert_eq!(other.max_sensor_age_days, TransmitterConfig::dexcom_g7("DX01AB").max_sensor_age_days);
        assert_ne!(other.poll_interval_secs, 0);
    }

    #[test]
    fn test_update_last_device() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        update_last_device(&path, "AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(
            Config::load_from(&path).last_device.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }
}
