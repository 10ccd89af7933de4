//! Per-transmitter configuration.
//!
//! [`TransmitterConfig`] is what a host application persists for one
//! transmitter. It deserializes from TOML with every field optional:
//!
//! ```
//! use cgm_core::TransmitterConfig;
//! use cgm_types::TransmitterKind;
//!
//! let config: TransmitterConfig = toml::from_str(r#"
//!     kind = "blucon"
//!     transmitter_id = "BLU12345"
//!     max_resends = 5
//! "#).unwrap();
//!
//! assert_eq!(config.kind, TransmitterKind::Blucon);
//! assert_eq!(config.sample_spacing_secs, 290);
//! config.validate().unwrap();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cgm_types::TransmitterKind;
pub use cgm_types::dexcom::TRANSMITTER_ID_LEN;

use crate::error::{Error, Result};
use crate::link::LinkOptions;
use crate::reconcile::SampleReconciler;
use crate::reconnect::ReconnectOptions;

/// Libre 1 wear time plus the 12 hour grace period.
pub const LIBRE_MAX_SENSOR_AGE_DAYS: f64 = 14.5;
/// Dexcom G5 wear time plus the 12 hour grace period.
pub const G5_MAX_SENSOR_AGE_DAYS: f64 = 7.5;
/// Dexcom G6 wear time plus the 12 hour grace period.
pub const G6_MAX_SENSOR_AGE_DAYS: f64 = 10.5;
/// Dexcom G7 wear time plus the 12 hour grace period.
pub const G7_MAX_SENSOR_AGE_DAYS: f64 = 10.5;
/// Dexcom Stelo wear time plus the 12 hour grace period.
pub const STELO_MAX_SENSOR_AGE_DAYS: f64 = 15.5;

fn default_kind() -> TransmitterKind {
    TransmitterKind::MiaoMiao
}

fn default_max_sensor_age_days() -> f64 {
    LIBRE_MAX_SENSOR_AGE_DAYS
}

fn default_step_timeout_secs() -> u64 {
    5
}

fn default_connecting_watchdog_secs() -> u64 {
    5
}

fn default_sample_spacing_secs() -> u64 {
    290
}

fn default_dedupe_tolerance_secs() -> u64 {
    30
}

fn default_fragment_window_secs() -> u64 {
    5
}

fn default_max_resends() -> u32 {
    3
}

fn default_rejection_cooldown_secs() -> u64 {
    180
}

fn default_cycle_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

/// Reconnection backoff, in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Settings for one transmitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    /// Transmitter family.
    #[serde(default = "default_kind")]
    pub kind: TransmitterKind,
    /// Advertised name or serial of the transmitter to pair with. Empty
    /// means the first transmitter of the right family.
    pub transmitter_id: String,
    /// Raw values are sent to an external calibration service.
    pub web_oop_enabled: bool,
    /// Calibration uses a non-fixed slope.
    pub non_fixed_slope_enabled: bool,
    /// Readings from older sensors are dropped.
    #[serde(default = "default_max_sensor_age_days")]
    pub max_sensor_age_days: f64,
    /// Timeout for each discovery, subscription and write step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// A connection attempt longer than this is abandoned.
    #[serde(default = "default_connecting_watchdog_secs")]
    pub connecting_watchdog_secs: u64,
    pub reconnect: ReconnectConfig,
    /// Samples closer than this collapse to the newer one.
    #[serde(default = "default_sample_spacing_secs")]
    pub sample_spacing_secs: u64,
    /// Samples this close to the newest stored one are replays.
    #[serde(default = "default_dedupe_tolerance_secs")]
    pub dedupe_tolerance_secs: u64,
    /// All fragments of a memory image must arrive within this window.
    #[serde(default = "default_fragment_window_secs")]
    pub fragment_window_secs: u64,
    /// Requests repeated after a CRC failure before giving up.
    #[serde(default = "default_max_resends")]
    pub max_resends: u32,
    /// How long a transmitter owned by another host is skipped.
    #[serde(default = "default_rejection_cooldown_secs")]
    pub rejection_cooldown_secs: u64,
    /// Upper bound on one connection cycle.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    /// Pause between cycles for transmitters that disconnect after each one.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            transmitter_id: String::new(),
            web_oop_enabled: false,
            non_fixed_slope_enabled: false,
            max_sensor_age_days: default_max_sensor_age_days(),
            step_timeout_secs: default_step_timeout_secs(),
            connecting_watchdog_secs: default_connecting_watchdog_secs(),
            reconnect: ReconnectConfig::default(),
            sample_spacing_secs: default_sample_spacing_secs(),
            dedupe_tolerance_secs: default_dedupe_tolerance_secs(),
            fragment_window_secs: default_fragment_window_secs(),
            max_resends: default_max_resends(),
            rejection_cooldown_secs: default_rejection_cooldown_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl TransmitterConfig {
    /// Defaults for `kind`.
    pub fn new(kind: TransmitterKind) -> Self {
        let max_sensor_age_days = match kind {
            TransmitterKind::DexcomG5 => G5_MAX_SENSOR_AGE_DAYS,
            TransmitterKind::DexcomG6 => G6_MAX_SENSOR_AGE_DAYS,
            TransmitterKind::DexcomG7 => G7_MAX_SENSOR_AGE_DAYS,
            _ => LIBRE_MAX_SENSOR_AGE_DAYS,
        };
        Self {
            kind,
            max_sensor_age_days,
            ..Default::default()
        }
    }

    /// A Blucon with the given name.
    pub fn blucon(id: impl Into<String>) -> Self {
        Self::new(TransmitterKind::Blucon).with_transmitter_id(id)
    }

    /// Any MiaoMiao in range.
    pub fn miaomiao() -> Self {
        Self::new(TransmitterKind::MiaoMiao)
    }

    /// Any Bubble in range.
    pub fn bubble() -> Self {
        Self::new(TransmitterKind::Bubble)
    }

    /// Any Atom in range.
    pub fn atom() -> Self {
        Self::new(TransmitterKind::Atom)
    }

    /// A Dexcom G5 with the six-character ID printed on the transmitter.
    pub fn dexcom_g5(id: impl Into<String>) -> Self {
        Self::new(TransmitterKind::DexcomG5).with_transmitter_id(id)
    }

    /// A Dexcom G6 with the six-character ID printed on the transmitter.
    pub fn dexcom_g6(id: impl Into<String>) -> Self {
        Self::new(TransmitterKind::DexcomG6).with_transmitter_id(id)
    }

    /// A Dexcom G7, ONE+ or Stelo with the given name. Stelo names start
    /// with `DX01` and get the longer wear time.
    pub fn dexcom_g7(id: impl Into<String>) -> Self {
        let id = id.into();
        let max_days = if id.starts_with("DX01") {
            STELO_MAX_SENSOR_AGE_DAYS
        } else {
            G7_MAX_SENSOR_AGE_DAYS
        };
        Self::new(TransmitterKind::DexcomG7)
            .with_transmitter_id(id)
            .with_max_sensor_age_days(max_days)
    }

    #[must_use]
    pub fn with_transmitter_id(mut self, id: impl Into<String>) -> Self {
        self.transmitter_id = id.into();
        self
    }

    #[must_use]
    pub fn with_max_sensor_age_days(mut self, days: f64) -> Self {
        self.max_sensor_age_days = days;
        self
    }

    #[must_use]
    pub fn with_sample_spacing_secs(mut self, secs: u64) -> Self {
        self.sample_spacing_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_resends(mut self, resends: u32) -> Self {
        self.max_resends = resends;
        self
    }

    #[must_use]
    pub fn with_cycle_timeout_secs(mut self, secs: u64) -> Self {
        self.cycle_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn with_step_timeout_secs(mut self, secs: u64) -> Self {
        self.step_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_web_oop(mut self, enabled: bool) -> Self {
        self.web_oop_enabled = enabled;
        self
    }

    /// Maximum sensor age in whole minutes.
    #[must_use]
    pub fn max_sensor_age_minutes(&self) -> u32 {
        let minutes = (self.max_sensor_age_days * 1440.0).round();
        if minutes <= 0.0 {
            0
        } else if minutes >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            minutes as u32
        }
    }

    #[must_use]
    pub fn sample_spacing(&self) -> time::Duration {
        time::Duration::seconds(secs_i64(self.sample_spacing_secs))
    }

    #[must_use]
    pub fn dedupe_tolerance(&self) -> time::Duration {
        time::Duration::seconds(secs_i64(self.dedupe_tolerance_secs))
    }

    #[must_use]
    pub fn fragment_window(&self) -> Duration {
        Duration::from_secs(self.fragment_window_secs)
    }

    #[must_use]
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn rejection_cooldown(&self) -> Duration {
        Duration::from_secs(self.rejection_cooldown_secs)
    }

    /// Link timing derived from this configuration.
    #[must_use]
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            connecting_watchdog: Duration::from_secs(self.connecting_watchdog_secs),
            reconnect: ReconnectOptions::new()
                .initial_delay(Duration::from_secs(self.reconnect.initial_delay_secs))
                .max_delay(Duration::from_secs(self.reconnect.max_delay_secs)),
            rejection_cooldown: self.rejection_cooldown(),
        }
    }

    /// Reconciler using the configured spacing and tolerance.
    #[must_use]
    pub fn reconciler(&self) -> SampleReconciler {
        SampleReconciler::new(self.sample_spacing(), self.dedupe_tolerance())
    }

    /// Check the configuration for values the session cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("step_timeout_secs", self.step_timeout_secs),
            ("connecting_watchdog_secs", self.connecting_watchdog_secs),
            ("fragment_window_secs", self.fragment_window_secs),
            ("cycle_timeout_secs", self.cycle_timeout_secs),
            ("sample_spacing_secs", self.sample_spacing_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::invalid_config(format!("{name} must be > 0")));
        }
        if !(self.max_sensor_age_days.is_finite() && self.max_sensor_age_days > 0.0) {
            return Err(Error::invalid_config("max_sensor_age_days must be > 0"));
        }
        if self.kind == TransmitterKind::Blucon && self.transmitter_id.trim().is_empty() {
            return Err(Error::invalid_config("a Blucon needs its transmitter_id"));
        }
        if matches!(self.kind, TransmitterKind::DexcomG5 | TransmitterKind::DexcomG6)
            && self.transmitter_id.len() != TRANSMITTER_ID_LEN
        {
            return Err(Error::invalid_config(format!(
                "a {} needs its {TRANSMITTER_ID_LEN}-character transmitter_id",
                self.kind
            )));
        }
        self.link_options().reconnect.validate()
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransmitterConfig::default();
        assert_eq!(config.sample_spacing(), time::Duration::seconds(290));
        assert_eq!(config.dedupe_tolerance(), time::Duration::seconds(30));
        assert_eq!(config.fragment_window(), Duration::from_secs(5));
        assert_eq!(config.max_resends, 3);
        assert_eq!(config.rejection_cooldown(), Duration::from_secs(180));
        assert_eq!(config.link_options(), LinkOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(TransmitterConfig::blucon("BLU1").kind, TransmitterKind::Blucon);
        assert_eq!(TransmitterConfig::miaomiao().max_sensor_age_minutes(), 20_880);
        assert_eq!(TransmitterConfig::dexcom_g7("DXCM12").max_sensor_age_minutes(), 15_120);
        assert_eq!(TransmitterConfig::dexcom_g7("DX01AB").max_sensor_age_minutes(), 22_320);
        assert_eq!(TransmitterConfig::dexcom_g5("4G1234").max_sensor_age_minutes(), 10_800);
        assert_eq!(TransmitterConfig::dexcom_g6("8G1234").max_sensor_age_minutes(), 15_120);
        assert_eq!(TransmitterConfig::bubble().max_sensor_age_minutes(), 20_880);
        assert_eq!(TransmitterConfig::atom().kind, TransmitterKind::Atom);
    }

    #[test]
    fn test_dexcom_id_length_is_checked() {
        assert!(TransmitterConfig::dexcom_g6("8G1234").validate().is_ok());
        assert!(TransmitterConfig::dexcom_g6("8G123").validate().is_err());
        assert!(TransmitterConfig::dexcom_g5("").validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: TransmitterConfig = toml::from_str(
            r#"
            kind = "dexcom-g7"
            transmitter_id = "DXCM12"

            [reconnect]
            max_delay_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, TransmitterKind::DexcomG7);
        assert_eq!(config.reconnect.initial_delay_secs, 1);
        assert_eq!(config.reconnect.max_delay_secs, 120);
        assert_eq!(config.poll_interval_secs, 300);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TransmitterConfig::blucon("BLU1").with_max_resends(1);
        let text = toml::to_string(&config).unwrap();
        let back: TransmitterConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(matches!(
            TransmitterConfig::blucon("").validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(TransmitterConfig::miaomiao()
            .with_step_timeout_secs(0)
            .validate()
            .is_err());
        assert!(TransmitterConfig::miaomiao()
            .with_max_sensor_age_days(f64::NAN)
            .validate()
            .is_err());
        let mut config = TransmitterConfig::miaomiao();
        config.reconnect.max_delay_secs = 0;
        assert!(config.validate().is_err());
    }
}
