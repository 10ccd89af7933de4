//! Core types for glucose transmitter data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::SensorError;

/// Lower bound of the physiological glucose range in mg/dL.
pub const GLUCOSE_MIN_MG_DL: f64 = 20.0;

/// Upper bound of the physiological glucose range in mg/dL.
pub const GLUCOSE_MAX_MG_DL: f64 = 600.0;

/// Physical sampling interval of a Libre sensor history slot, less jitter tolerance.
pub const DEFAULT_SAMPLE_SPACING: Duration = Duration::seconds(5 * 60 - 10);

/// Tolerance applied around the dedupe watermark.
pub const DEDUPE_TOLERANCE: Duration = Duration::seconds(30);

/// Family of transmitter hardware the core knows how to talk to.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new transmitters
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[non_exhaustive]
pub enum TransmitterKind {
    /// Blucon clip-on reader for Libre 1 sensors.
    Blucon,
    /// MiaoMiao clip-on reader for Libre 1 sensors.
    #[cfg_attr(feature = "serde", serde(rename = "miaomiao"))]
    MiaoMiao,
    /// Bubble clip-on reader.
    Bubble,
    /// Atom clip-on reader, a Bubble derivative that also reports patch info.
    Atom,
    /// Dexcom G5 transmitter.
    DexcomG5,
    /// Dexcom G6 transmitter.
    DexcomG6,
    /// Dexcom G7 / ONE+ / Stelo sensors.
    DexcomG7,
}

impl TransmitterKind {
    /// All supported transmitter kinds.
    pub const ALL: [TransmitterKind; 7] = [
        TransmitterKind::Blucon,
        TransmitterKind::MiaoMiao,
        TransmitterKind::Bubble,
        TransmitterKind::Atom,
        TransmitterKind::DexcomG5,
        TransmitterKind::DexcomG6,
        TransmitterKind::DexcomG7,
    ];

    /// Detect a transmitter family from an advertised device name.
    ///
    /// G5 and G6 transmitters advertise the same `Dexcom` name; it maps to
    /// G6, the family still in use.
    ///
    /// # Examples
    ///
    /// ```
    /// use cgm_types::TransmitterKind;
    ///
    /// assert_eq!(TransmitterKind::from_name("BLU00123"), Some(TransmitterKind::Blucon));
    /// assert_eq!(TransmitterKind::from_name("miaomiao2"), Some(TransmitterKind::MiaoMiao));
    /// assert_eq!(TransmitterKind::from_name("DXCMab"), None);
    /// assert_eq!(TransmitterKind::from_name("DX02ab"), Some(TransmitterKind::DexcomG7));
    /// assert_eq!(TransmitterKind::from_name("DexcomAB"), Some(TransmitterKind::DexcomG6));
    /// assert_eq!(TransmitterKind::from_name("Bubble_a1"), Some(TransmitterKind::Bubble));
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        if upper.starts_with("BLU") {
            Some(TransmitterKind::Blucon)
        } else if upper.contains("MIAOMIAO") {
            Some(TransmitterKind::MiaoMiao)
        } else if upper.starts_with("BUBBLE") {
            Some(TransmitterKind::Bubble)
        } else if upper.starts_with("ATOM") {
            Some(TransmitterKind::Atom)
        } else if upper.starts_with("DEXCOM") {
            Some(TransmitterKind::DexcomG6)
        } else if upper.starts_with("DX") && !upper.starts_with("DXCM") {
            Some(TransmitterKind::DexcomG7)
        } else {
            None
        }
    }

    /// Whether the transmitter streams continuously or is polled once per wake cycle.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        !matches!(
            self,
            TransmitterKind::Blucon | TransmitterKind::DexcomG5 | TransmitterKind::DexcomG6
        )
    }
}

impl fmt::Display for TransmitterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitterKind::Blucon => write!(f, "Blucon"),
            TransmitterKind::MiaoMiao => write!(f, "MiaoMiao"),
            TransmitterKind::Bubble => write!(f, "Bubble"),
            TransmitterKind::Atom => write!(f, "Atom"),
            TransmitterKind::DexcomG5 => write!(f, "Dexcom G5"),
            TransmitterKind::DexcomG6 => write!(f, "Dexcom G6"),
            TransmitterKind::DexcomG7 => write!(f, "Dexcom G7"),
        }
    }
}

impl core::str::FromStr for TransmitterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blucon" => Ok(TransmitterKind::Blucon),
            "miaomiao" => Ok(TransmitterKind::MiaoMiao),
            "bubble" => Ok(TransmitterKind::Bubble),
            "atom" => Ok(TransmitterKind::Atom),
            "dexcom-g5" | "dexcomg5" | "g5" => Ok(TransmitterKind::DexcomG5),
            "dexcom-g6" | "dexcomg6" | "g6" => Ok(TransmitterKind::DexcomG6),
            "dexcom-g7" | "dexcomg7" | "g7" => Ok(TransmitterKind::DexcomG7),
            other => Err(format!("unknown transmitter kind '{other}'")),
        }
    }
}

/// One timestamped glucose measurement.
///
/// Values are immutable once decoded. `raw_value` is never negative.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlucoseSample {
    /// Absolute UTC instant the sensor took the measurement.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Glucose concentration in mg/dL.
    pub raw_value: f64,
    /// Smoothed value when the transmitter supplies one.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub filtered_value: Option<f64>,
}

impl GlucoseSample {
    /// Create a sample, clamping negative values to zero.
    #[must_use]
    pub fn new(timestamp: OffsetDateTime, raw_value: f64) -> Self {
        Self {
            timestamp,
            raw_value: raw_value.max(0.0),
            filtered_value: None,
        }
    }

    /// Attach a filtered value.
    #[must_use]
    pub fn with_filtered(mut self, filtered: f64) -> Self {
        self.filtered_value = Some(filtered.max(0.0));
        self
    }

    /// Check the sample against the physiological range.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::InvalidGlucoseRange`] for values outside
    /// [`GLUCOSE_MIN_MG_DL`]..=[`GLUCOSE_MAX_MG_DL`].
    pub fn check_range(&self) -> Result<(), SensorError> {
        if (GLUCOSE_MIN_MG_DL..=GLUCOSE_MAX_MG_DL).contains(&self.raw_value) {
            Ok(())
        } else {
            Err(SensorError::InvalidGlucoseRange {
                value: self.raw_value,
                min: GLUCOSE_MIN_MG_DL,
                max: GLUCOSE_MAX_MG_DL,
            })
        }
    }
}

/// Lifecycle state reported in byte 4 of a Libre sensor memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum SensorState {
    /// Sensor not yet activated.
    NotYetStarted = 0x01,
    /// Sensor warming up (first hour).
    Starting = 0x02,
    /// Sensor delivering readings.
    Ready = 0x03,
    /// Sensor past its wear time; last readings still readable.
    Expired = 0x04,
    /// Sensor shut down.
    Shutdown = 0x05,
    /// Sensor reported a failure.
    Failure = 0x06,
    /// Any other byte.
    Unknown = 0x00,
}

impl From<u8> for SensorState {
    fn from(value: u8) -> Self {
        match value {
            0x01 => SensorState::NotYetStarted,
            0x02 => SensorState::Starting,
            0x03 => SensorState::Ready,
            0x04 => SensorState::Expired,
            0x05 => SensorState::Shutdown,
            0x06 => SensorState::Failure,
            _ => SensorState::Unknown,
        }
    }
}

impl SensorState {
    /// Whether glucose data in the memory image may be trusted.
    #[must_use]
    pub fn has_readings(&self) -> bool {
        matches!(self, SensorState::Ready | SensorState::Expired)
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorState::NotYetStarted => "not yet started",
            SensorState::Starting => "starting",
            SensorState::Ready => "ready",
            SensorState::Expired => "expired",
            SensorState::Shutdown => "shut down",
            SensorState::Failure => "failure",
            SensorState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Libre sensor generation, used as the serial-number prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LibreFamily {
    /// Libre 1 (prefix `0`).
    Libre1,
    /// Libre Pro / H (prefix `1`).
    LibreProH,
    /// Libre 2 (prefix `3`).
    Libre2,
}

impl LibreFamily {
    /// Sensor generation from the first byte of its patch info.
    ///
    /// Returns `None` for generations with an unknown layout.
    #[must_use]
    pub fn from_patch_info(first: u8) -> Option<Self> {
        match first {
            0xDF | 0xA2 => Some(LibreFamily::Libre1),
            0x70 => Some(LibreFamily::LibreProH),
            0x9D | 0xC5 | 0xC6 | 0x76 | 0x7F => Some(LibreFamily::Libre2),
            _ => None,
        }
    }

    /// Serial number prefix digit.
    #[must_use]
    pub fn serial_prefix(&self) -> char {
        match self {
            LibreFamily::Libre1 => '0',
            LibreFamily::LibreProH => '1',
            LibreFamily::Libre2 => '3',
        }
    }
}
