//! Dexcom transmitter messages.
//!
//! Every Dexcom message starts with a one-byte opcode. Multi-byte integers
//! are little-endian. Device times are seconds since activation (sensor
//! activation for G7, transmitter activation for G5/G6).
//!
//! G5/G6 transmitters are driven by the host: it authenticates with an
//! AES challenge derived from the transmitter ID, then requests the clock,
//! the latest reading and a backfill range on the control characteristic.
//! Requests on the control characteristic carry an XModem CRC suffix.

use core::fmt;

use aws_lc_rs::cipher::{AES_128, EncryptingKey, UnboundCipherKey};
use bytes::Buf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::crc::append_crc16_xmodem;
use crate::error::{ProtocolError, Result};
use crate::types::GlucoseSample;

/// Opcode byte of a Dexcom message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DexcomOpcode {
    AuthRequestTx,
    AuthRequestRx,
    AuthChallengeTx,
    AuthChallengeRx,
    KeepAlive,
    BondRequestTx,
    PairRequestRx,
    DisconnectTx,
    SetAdvertisementParametersRx,
    FirmwareVersionTx,
    FirmwareVersionRx,
    BatteryStatusTx,
    BatteryStatusRx,
    TransmitterTimeTx,
    TransmitterTimeRx,
    SessionStartTx,
    SessionStartRx,
    SessionStopTx,
    SessionStopRx,
    SensorDataTx,
    SensorDataRx,
    GlucoseTx,
    GlucoseRx,
    CalibrationDataTx,
    CalibrationDataRx,
    CalibrateGlucoseTx,
    CalibrateGlucoseRx,
    GlucoseHistoryTx,
    ResetTx,
    ResetRx,
    TransmitterVersionTx,
    TransmitterVersionRx,
    /// G6 glucose request; on G7 the same byte carries the glucose notification.
    GlucoseG6Tx,
    GlucoseG6Rx,
    GlucoseBackfillTx,
    GlucoseBackfillRx,
    BackfillFinished,
    KeepAliveRx,
    /// Any byte not listed above.
    Unknown(u8),
}

impl DexcomOpcode {
    /// Wire value.
    #[must_use]
    pub fn byte(&self) -> u8 {
        match self {
            DexcomOpcode::AuthRequestTx => 0x01,
            DexcomOpcode::AuthRequestRx => 0x03,
            DexcomOpcode::AuthChallengeTx => 0x04,
            DexcomOpcode::AuthChallengeRx => 0x05,
            DexcomOpcode::KeepAlive => 0x06,
            DexcomOpcode::BondRequestTx => 0x07,
            DexcomOpcode::PairRequestRx => 0x08,
            DexcomOpcode::DisconnectTx => 0x09,
            DexcomOpcode::SetAdvertisementParametersRx => 0x1c,
            DexcomOpcode::FirmwareVersionTx => 0x20,
            DexcomOpcode::FirmwareVersionRx => 0x21,
            DexcomOpcode::BatteryStatusTx => 0x22,
            DexcomOpcode::BatteryStatusRx => 0x23,
            DexcomOpcode::TransmitterTimeTx => 0x24,
            DexcomOpcode::TransmitterTimeRx => 0x25,
            DexcomOpcode::SessionStartTx => 0x26,
            DexcomOpcode::SessionStartRx => 0x27,
            DexcomOpcode::SessionStopTx => 0x28,
            DexcomOpcode::SessionStopRx => 0x29,
            DexcomOpcode::SensorDataTx => 0x2e,
            DexcomOpcode::SensorDataRx => 0x2f,
            DexcomOpcode::GlucoseTx => 0x30,
            DexcomOpcode::GlucoseRx => 0x31,
            DexcomOpcode::CalibrationDataTx => 0x32,
            DexcomOpcode::CalibrationDataRx => 0x33,
            DexcomOpcode::CalibrateGlucoseTx => 0x34,
            DexcomOpcode::CalibrateGlucoseRx => 0x35,
            DexcomOpcode::GlucoseHistoryTx => 0x3e,
            DexcomOpcode::ResetTx => 0x42,
            DexcomOpcode::ResetRx => 0x43,
            DexcomOpcode::TransmitterVersionTx => 0x4a,
            DexcomOpcode::TransmitterVersionRx => 0x4b,
            DexcomOpcode::GlucoseG6Tx => 0x4e,
            DexcomOpcode::GlucoseG6Rx => 0x4f,
            DexcomOpcode::GlucoseBackfillTx => 0x50,
            DexcomOpcode::GlucoseBackfillRx => 0x51,
            DexcomOpcode::BackfillFinished => 0x59,
            DexcomOpcode::KeepAliveRx => 0xff,
            DexcomOpcode::Unknown(b) => *b,
        }
    }
}

impl From<u8> for DexcomOpcode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => DexcomOpcode::AuthRequestTx,
            0x03 => DexcomOpcode::AuthRequestRx,
            0x04 => DexcomOpcode::AuthChallengeTx,
            0x05 => DexcomOpcode::AuthChallengeRx,
            0x06 => DexcomOpcode::KeepAlive,
            0x07 => DexcomOpcode::BondRequestTx,
            0x08 => DexcomOpcode::PairRequestRx,
            0x09 => DexcomOpcode::DisconnectTx,
            0x1c => DexcomOpcode::SetAdvertisementParametersRx,
            0x20 => DexcomOpcode::FirmwareVersionTx,
            0x21 => DexcomOpcode::FirmwareVersionRx,
            0x22 => DexcomOpcode::BatteryStatusTx,
            0x23 => DexcomOpcode::BatteryStatusRx,
            0x24 => DexcomOpcode::TransmitterTimeTx,
            0x25 => DexcomOpcode::TransmitterTimeRx,
            0x26 => DexcomOpcode::SessionStartTx,
            0x27 => DexcomOpcode::SessionStartRx,
            0x28 => DexcomOpcode::SessionStopTx,
            0x29 => DexcomOpcode::SessionStopRx,
            0x2e => DexcomOpcode::SensorDataTx,
            0x2f => DexcomOpcode::SensorDataRx,
            0x30 => DexcomOpcode::GlucoseTx,
            0x31 => DexcomOpcode::GlucoseRx,
            0x32 => DexcomOpcode::CalibrationDataTx,
            0x33 => DexcomOpcode::CalibrationDataRx,
            0x34 => DexcomOpcode::CalibrateGlucoseTx,
            0x35 => DexcomOpcode::CalibrateGlucoseRx,
            0x3e => DexcomOpcode::GlucoseHistoryTx,
            0x42 => DexcomOpcode::ResetTx,
            0x43 => DexcomOpcode::ResetRx,
            0x4a => DexcomOpcode::TransmitterVersionTx,
            0x4b => DexcomOpcode::TransmitterVersionRx,
            0x4e => DexcomOpcode::GlucoseG6Tx,
            0x4f => DexcomOpcode::GlucoseG6Rx,
            0x50 => DexcomOpcode::GlucoseBackfillTx,
            0x51 => DexcomOpcode::GlucoseBackfillRx,
            0x59 => DexcomOpcode::BackfillFinished,
            0xff => DexcomOpcode::KeepAliveRx,
            other => DexcomOpcode::Unknown(other),
        }
    }
}

/// Calibration/algorithm state reported with each Dexcom reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum DexcomAlgorithmState {
    None = 0x00,
    SessionStopped = 0x01,
    SensorWarmup = 0x02,
    ExcessNoise = 0x03,
    FirstOfTwoBgsNeeded = 0x04,
    SecondOfTwoBgsNeeded = 0x05,
    Okay = 0x06,
    NeedsCalibration = 0x07,
    CalibrationError1 = 0x08,
    CalibrationError2 = 0x09,
    CalibrationLinearityFitFailure = 0x0a,
    SensorFailedDueToCountsAberration = 0x0b,
    SensorFailedDueToResidualAberration = 0x0c,
    OutOfCalibrationDueToOutlier = 0x0d,
    OutlierCalibrationRequest = 0x0e,
    SessionExpired = 0x0f,
    SessionFailedDueToUnrecoverableError = 0x10,
    SessionFailedDueToTransmitterError = 0x11,
    TemporarySensorIssue = 0x12,
    SensorFailedDueToProgressiveSensorDecline = 0x13,
    SensorFailedDueToHighCountsAberration = 0x14,
    SensorFailedDueToLowCountsAberration = 0x15,
    SensorFailedDueToRestart = 0x16,
}

impl DexcomAlgorithmState {
    /// Parse a state byte; unknown bytes map to `None`.
    #[must_use]
    pub fn from_byte(value: u8) -> Option<Self> {
        let state = match value {
            0x00 => Self::None,
            0x01 => Self::SessionStopped,
            0x02 => Self::SensorWarmup,
            0x03 => Self::ExcessNoise,
            0x04 => Self::FirstOfTwoBgsNeeded,
            0x05 => Self::SecondOfTwoBgsNeeded,
            0x06 => Self::Okay,
            0x07 => Self::NeedsCalibration,
            0x08 => Self::CalibrationError1,
            0x09 => Self::CalibrationError2,
            0x0a => Self::CalibrationLinearityFitFailure,
            0x0b => Self::SensorFailedDueToCountsAberration,
            0x0c => Self::SensorFailedDueToResidualAberration,
            0x0d => Self::OutOfCalibrationDueToOutlier,
            0x0e => Self::OutlierCalibrationRequest,
            0x0f => Self::SessionExpired,
            0x10 => Self::SessionFailedDueToUnrecoverableError,
            0x11 => Self::SessionFailedDueToTransmitterError,
            0x12 => Self::TemporarySensorIssue,
            0x13 => Self::SensorFailedDueToProgressiveSensorDecline,
            0x14 => Self::SensorFailedDueToHighCountsAberration,
            0x15 => Self::SensorFailedDueToLowCountsAberration,
            0x16 => Self::SensorFailedDueToRestart,
            _ => return None,
        };
        Some(state)
    }

    /// Whether readings in this state are trustworthy.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            DexcomAlgorithmState::Okay | DexcomAlgorithmState::NeedsCalibration
        )
    }

    /// Whether the session has ended and no further readings will arrive.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        (*self as u8) >= DexcomAlgorithmState::SessionExpired as u8
            && *self != DexcomAlgorithmState::TemporarySensorIssue
    }
}

impl fmt::Display for DexcomAlgorithmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decoded glucose notification.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DexcomGlucose {
    /// Message sequence number.
    pub sequence: u32,
    /// Device time of the message, seconds since activation.
    pub device_time: u32,
    /// Seconds between the measurement and the message (G7 only).
    pub age_seconds: u8,
    /// Calculated glucose in mg/dL, absent when the sensor withheld it.
    pub glucose: Option<u16>,
    /// Value may be displayed but not used for treatment decisions.
    pub display_only: bool,
    /// Algorithm state.
    pub state: DexcomAlgorithmState,
    /// Rate of change in mg/dL/min.
    pub trend: Option<f64>,
    /// Predicted glucose (G7 only).
    pub predicted: Option<u16>,
}

impl DexcomGlucose {
    /// Time since activation at the moment the message was received.
    #[must_use]
    pub fn sensor_age(&self) -> Duration {
        Duration::seconds(i64::from(self.device_time) + i64::from(self.age_seconds))
    }

    /// Instant of the measurement, given the receive time.
    #[must_use]
    pub fn measured_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - Duration::seconds(i64::from(self.age_seconds))
    }

    /// Activation instant, given the receive time.
    #[must_use]
    pub fn activation(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - self.sensor_age()
    }

    /// Convert to a sample if a reliable value is present.
    #[must_use]
    pub fn to_sample(&self, now: OffsetDateTime) -> Option<GlucoseSample> {
        let glucose = self.glucose?;
        if !self.state.is_reliable() {
            return None;
        }
        Some(GlucoseSample::new(self.measured_at(now), f64::from(glucose)))
    }
}

fn trend_byte(b: u8) -> Option<f64> {
    if b == 0x7f {
        None
    } else {
        Some(f64::from(b as i8) / 10.0)
    }
}

fn masked_u16(v: u16) -> Option<u16> {
    if v == 0xffff { None } else { Some(v & 0x0fff) }
}

/// Minimum length of a G7 glucose notification.
pub const G7_GLUCOSE_LEN: usize = 19;
/// Minimum length of a G5/G6 glucose response.
pub const G6_GLUCOSE_LEN: usize = 14;

/// Decode a glucose message.
///
/// Accepts the G7 layout (opcode `0x4e`) and the G5/G6 layout
/// (opcodes `0x31` and `0x4f`). A non-zero status byte is reported as
/// malformed, matching transmitter behaviour for rejected requests.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownOpcode`] for other opcodes and
/// [`ProtocolError::MalformedFrame`] for short or rejected frames.
pub fn decode_glucose_message(data: &[u8]) -> Result<DexcomGlucose> {
    let Some(&opcode) = data.first() else {
        return Err(ProtocolError::too_short("glucose message", 1, 0));
    };
    match DexcomOpcode::from(opcode) {
        DexcomOpcode::GlucoseG6Tx => decode_g7_glucose(data),
        DexcomOpcode::GlucoseRx | DexcomOpcode::GlucoseG6Rx => decode_g6_glucose(data),
        _ => Err(ProtocolError::UnknownOpcode(vec![opcode])),
    }
}

fn decode_g7_glucose(data: &[u8]) -> Result<DexcomGlucose> {
    if data.len() < G7_GLUCOSE_LEN {
        return Err(ProtocolError::too_short("G7 glucose", G7_GLUCOSE_LEN, data.len()));
    }
    if data[1] != 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "G7 glucose status {:#04x}",
            data[1]
        )));
    }
    let mut buf = &data[2..];
    let device_time = buf.get_u32_le();
    let sequence = u32::from(buf.get_u16_le());
    buf.advance(2);
    let age_seconds = buf.get_u8();
    buf.advance(1);
    let glucose_raw = buf.get_u16_le();
    let state_byte = buf.get_u8();
    let trend = trend_byte(buf.get_u8());
    let predicted = masked_u16(buf.get_u16_le());
    let flags = buf.get_u8();

    let glucose = masked_u16(glucose_raw);
    Ok(DexcomGlucose {
        sequence,
        device_time,
        age_seconds,
        glucose,
        display_only: glucose.is_some() && flags & 0x10 != 0,
        state: DexcomAlgorithmState::from_byte(state_byte).unwrap_or(DexcomAlgorithmState::None),
        trend,
        predicted,
    })
}

fn decode_g6_glucose(data: &[u8]) -> Result<DexcomGlucose> {
    if data.len() < G6_GLUCOSE_LEN {
        return Err(ProtocolError::too_short("G6 glucose", G6_GLUCOSE_LEN, data.len()));
    }
    if data[1] != 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "G6 glucose status {:#04x}",
            data[1]
        )));
    }
    let mut buf = &data[2..];
    let sequence = buf.get_u32_le();
    let device_time = buf.get_u32_le();
    let glucose_bytes = buf.get_u16_le();
    let state_byte = buf.get_u8();
    let trend = trend_byte(buf.get_u8());

    Ok(DexcomGlucose {
        sequence,
        device_time,
        age_seconds: 0,
        glucose: Some(glucose_bytes & 0x0fff),
        display_only: glucose_bytes & 0xf000 != 0,
        state: DexcomAlgorithmState::from_byte(state_byte).unwrap_or(DexcomAlgorithmState::None),
        trend,
        predicted: None,
    })
}

/// One decoded backfill record.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BackfillRecord {
    /// Device time of the measurement, seconds since activation.
    pub device_time: u32,
    /// Glucose in mg/dL.
    pub glucose: u16,
    /// Algorithm state at the time of the measurement.
    pub state: DexcomAlgorithmState,
    /// Raw trend byte.
    pub trend: Option<f64>,
}

impl BackfillRecord {
    /// Convert to a sample given the activation instant.
    #[must_use]
    pub fn to_sample(&self, activation: OffsetDateTime) -> GlucoseSample {
        GlucoseSample::new(
            activation + Duration::seconds(i64::from(self.device_time)),
            f64::from(self.glucose),
        )
    }
}

/// Length of a G7 backfill notification.
pub const G7_BACKFILL_LEN: usize = 9;

/// Decode one G7 backfill notification.
///
/// Layout: 24-bit device time, one reserved byte, glucose (u16, low 12
/// bits), algorithm state, one reserved byte, trend.
///
/// Returns `Ok(None)` for records without a reliable glucose value.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if `data` is not 9 bytes.
pub fn decode_backfill_record(data: &[u8]) -> Result<Option<BackfillRecord>> {
    if data.len() != G7_BACKFILL_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "G7 backfill requires {G7_BACKFILL_LEN} bytes, got {}",
            data.len()
        )));
    }
    let mut buf = data;
    let device_time = u32::from(buf.get_u16_le()) | (u32::from(buf.get_u8()) << 16);
    buf.advance(1);
    let glucose = masked_u16(buf.get_u16_le());
    let state = DexcomAlgorithmState::from_byte(buf.get_u8());
    buf.advance(1);
    let trend = trend_byte(buf.get_u8());

    Ok(match (glucose, state) {
        (Some(glucose), Some(state)) if state.is_reliable() && device_time != 0 => {
            Some(BackfillRecord {
                device_time,
                glucose,
                state,
                trend,
            })
        }
        _ => None,
    })
}

const BACKFILL_STREAM_CAP: usize = 1000;
const BACKFILL_STREAM_HEADER: usize = 4;
const BACKFILL_STREAM_RECORD: usize = 8;

/// Reassembles the G5/G6 backfill characteristic stream.
///
/// Each packet starts with a sequence byte and a reserved byte. Packets
/// are appended only when their sequence follows the previous one; the
/// assembled stream starts with a 4-byte header followed by 8-byte records
/// `(device_time u32, glucose u16, state u8, trend u8)`.
#[derive(Debug, Clone, Default)]
pub struct BackfillStream {
    data: Vec<u8>,
    last_sequence: u8,
    header_consumed: bool,
}

impl BackfillStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one packet; out-of-sequence packets are ignored.
    ///
    /// Returns whether the packet was accepted.
    pub fn push(&mut self, packet: &[u8]) -> bool {
        let Some(&sequence) = packet.first() else {
            return false;
        };
        if sequence != self.last_sequence.wrapping_add(1) {
            return false;
        }
        self.last_sequence = sequence;
        if let Some(payload) = packet.get(2..) {
            let room = BACKFILL_STREAM_CAP.saturating_sub(self.data.len());
            self.data.extend_from_slice(&payload[..payload.len().min(room)]);
        }
        true
    }

    /// Decode all complete records, keeping any trailing partial record.
    ///
    /// Only records in a reliable state with a non-zero device time are
    /// returned.
    pub fn decode(&mut self) -> Vec<BackfillRecord> {
        if !self.header_consumed {
            if self.data.len() < BACKFILL_STREAM_HEADER {
                return Vec::new();
            }
            self.data.drain(..BACKFILL_STREAM_HEADER);
            self.header_consumed = true;
        }

        let complete = self.data.len() / BACKFILL_STREAM_RECORD * BACKFILL_STREAM_RECORD;
        let records: Vec<BackfillRecord> = self.data[..complete]
            .chunks_exact(BACKFILL_STREAM_RECORD)
            .filter_map(|mut chunk| {
                let device_time = chunk.get_u32_le();
                let glucose = chunk.get_u16_le();
                let state = DexcomAlgorithmState::from_byte(chunk.get_u8())?;
                let trend = trend_byte(chunk.get_u8());
                (state.is_reliable() && device_time != 0).then_some(BackfillRecord {
                    device_time,
                    glucose: glucose & 0x0fff,
                    state,
                    trend,
                })
            })
            .collect();
        self.data.drain(..complete);
        records
    }

    /// Discard all buffered bytes and restart sequence tracking.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Authentication status reported on the authentication characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AuthChallengeRx {
    /// The transmitter accepted this host's credentials.
    pub authenticated: bool,
    /// The transmitter is bonded at the link layer.
    pub paired: bool,
}

impl AuthChallengeRx {
    /// Parse an `0x05` authentication status message.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames or a different opcode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(ProtocolError::too_short("auth challenge", 3, data.len()));
        }
        if data[0] != DexcomOpcode::AuthChallengeRx.byte() {
            return Err(ProtocolError::UnknownOpcode(vec![data[0]]));
        }
        Ok(Self {
            authenticated: data[1] == 1,
            paired: data[2] != 2,
        })
    }
}

/// Transmitter battery status (`0x23`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatteryStatusRx {
    pub status: u8,
    pub voltage_a: u16,
    pub voltage_b: u16,
    pub resistance: u16,
    pub runtime_days: u8,
    pub temperature: u8,
}

impl BatteryStatusRx {
    /// Minimum frame length.
    pub const LEN: usize = 10;

    /// Parse a battery status response.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames or a different opcode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::too_short("battery status", Self::LEN, data.len()));
        }
        if data[0] != DexcomOpcode::BatteryStatusRx.byte() {
            return Err(ProtocolError::UnknownOpcode(vec![data[0]]));
        }
        let mut buf = &data[1..];
        Ok(Self {
            status: buf.get_u8(),
            voltage_a: buf.get_u16_le(),
            voltage_b: buf.get_u16_le(),
            resistance: buf.get_u16_le(),
            runtime_days: buf.get_u8(),
            temperature: buf.get_u8(),
        })
    }
}

/// Transmitter clock (`0x25`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransmitterTimeRx {
    pub status: u8,
    /// Seconds since transmitter activation.
    pub current_time: u32,
    /// Device time the current session started at.
    pub session_start_time: u32,
}

impl TransmitterTimeRx {
    /// Minimum frame length.
    pub const LEN: usize = 10;

    /// Parse a transmitter time response.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames or a different opcode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::too_short("transmitter time", Self::LEN, data.len()));
        }
        if data[0] != DexcomOpcode::TransmitterTimeRx.byte() {
            return Err(ProtocolError::UnknownOpcode(vec![data[0]]));
        }
        let mut buf = &data[1..];
        Ok(Self {
            status: buf.get_u8(),
            current_time: buf.get_u32_le(),
            session_start_time: buf.get_u32_le(),
        })
    }

    /// Transmitter activation instant, given the receive time.
    #[must_use]
    pub fn activation(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - Duration::seconds(i64::from(self.current_time))
    }
}

/// Length of a G5/G6 transmitter ID.
pub const TRANSMITTER_ID_LEN: usize = 6;

/// Device time a G5/G6 transmitter reports when no sensor session runs.
pub const NO_SESSION: u32 = 0xffff_ffff;

/// Request that opens the authentication exchange.
#[must_use]
pub fn auth_request_tx(token: [u8; 8]) -> Vec<u8> {
    let mut m = Vec::with_capacity(10);
    m.push(DexcomOpcode::AuthRequestTx.byte());
    m.extend_from_slice(&token);
    m.push(0x02);
    m
}

/// Transmitter challenge (`0x03`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequestRx {
    /// The transmitter's hash of the host token.
    pub token_hash: [u8; 8],
    /// Bytes the host must encrypt to prove it knows the transmitter ID.
    pub challenge: [u8; 8],
}

impl AuthRequestRx {
    /// Frame length.
    pub const LEN: usize = 17;

    /// Parse a challenge message.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames or a different opcode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::too_short("auth request", Self::LEN, data.len()));
        }
        if data[0] != DexcomOpcode::AuthRequestRx.byte() {
            return Err(ProtocolError::UnknownOpcode(vec![data[0]]));
        }
        let mut token_hash = [0u8; 8];
        token_hash.copy_from_slice(&data[1..9]);
        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(&data[9..17]);
        Ok(Self {
            token_hash,
            challenge,
        })
    }
}

fn cipher_failed(_: aws_lc_rs::error::Unspecified) -> ProtocolError {
    ProtocolError::MalformedFrame("AES-128 key setup failed".to_string())
}

/// Encrypt `challenge` with the key derived from `transmitter_id`.
///
/// The key is the ASCII string `00<id>00<id>`. The challenge is repeated
/// to fill one AES block, encrypted with AES-128-ECB, and the first eight
/// bytes of the result are the answer.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if the ID is not
/// [`TRANSMITTER_ID_LEN`] bytes long.
pub fn challenge_hash(transmitter_id: &str, challenge: &[u8; 8]) -> Result<[u8; 8]> {
    let id = transmitter_id.as_bytes();
    if id.len() != TRANSMITTER_ID_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "transmitter id {transmitter_id:?} must be {TRANSMITTER_ID_LEN} characters"
        )));
    }
    let key_bytes = [&b"00"[..], id, &b"00"[..], id].concat();
    let key = UnboundCipherKey::new(&AES_128, &key_bytes).map_err(cipher_failed)?;
    let key = EncryptingKey::ecb(key).map_err(cipher_failed)?;

    let mut block = [0u8; 16];
    block[..8].copy_from_slice(challenge);
    block[8..].copy_from_slice(challenge);
    key.encrypt(&mut block).map_err(cipher_failed)?;

    let mut hash = [0u8; 8];
    hash.copy_from_slice(&block[..8]);
    Ok(hash)
}

/// Answer to an [`AuthRequestRx`].
#[must_use]
pub fn auth_challenge_tx(hash: [u8; 8]) -> Vec<u8> {
    let mut m = Vec::with_capacity(9);
    m.push(DexcomOpcode::AuthChallengeTx.byte());
    m.extend_from_slice(&hash);
    m
}

/// Ask the transmitter to keep the link open for `seconds` while bonding.
#[must_use]
pub fn keep_alive_tx(seconds: u8) -> [u8; 2] {
    [DexcomOpcode::KeepAlive.byte(), seconds]
}

/// Ask the transmitter to start link-layer bonding.
pub const BOND_REQUEST_TX: [u8; 1] = [0x07];

/// A control request without parameters, e.g. the clock or glucose request.
#[must_use]
pub fn control_request(opcode: DexcomOpcode) -> Vec<u8> {
    let mut m = vec![opcode.byte()];
    append_crc16_xmodem(&mut m);
    m
}

/// Request the readings between two device times.
///
/// The records stream in on the backfill characteristic and the
/// transmitter confirms the range with a [`GlucoseBackfillRx`].
#[must_use]
pub fn backfill_tx(start_time: u32, end_time: u32) -> Vec<u8> {
    let mut m = vec![DexcomOpcode::GlucoseBackfillTx.byte(), 0x05, 0x02, 0x00];
    m.extend_from_slice(&start_time.to_le_bytes());
    m.extend_from_slice(&end_time.to_le_bytes());
    m.extend_from_slice(&[0u8; 6]);
    append_crc16_xmodem(&mut m);
    m
}

/// Confirmation that a backfill range was sent (`0x51`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlucoseBackfillRx {
    pub status: u8,
    pub backfill_status: u8,
    pub identifier: u8,
    /// First device time covered.
    pub start_time: u32,
    /// Last device time covered.
    pub end_time: u32,
}

impl GlucoseBackfillRx {
    /// Minimum frame length.
    pub const LEN: usize = 12;

    /// Parse a backfill confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error for short frames or a different opcode.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ProtocolError::too_short("backfill response", Self::LEN, data.len()));
        }
        if data[0] != DexcomOpcode::GlucoseBackfillRx.byte() {
            return Err(ProtocolError::UnknownOpcode(vec![data[0]]));
        }
        let mut buf = &data[1..];
        Ok(Self {
            status: buf.get_u8(),
            backfill_status: buf.get_u8(),
            identifier: buf.get_u8(),
            start_time: buf.get_u32_le(),
            end_time: buf.get_u32_le(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_opcode_roundtrip_for_known_bytes() {
        for b in 0..=255u8 {
            assert_eq!(DexcomOpcode::from(b).byte(), b);
        }
        assert_eq!(DexcomOpcode::from(0x02), DexcomOpcode::Unknown(0x02));
    }

    #[test]
    fn test_g7_glucose_decoding() {
        let msg = g7_glucose(86_400, 288, 5, 123, 0x06);
        let g = decode_glucose_message(&msg).unwrap();
        assert_eq!(g.device_time, 86_400);
        assert_eq!(g.sequence, 288);
        assert_eq!(g.glucose, Some(123));
        assert_eq!(g.state, DexcomAlgorithmState::Okay);
        assert_eq!(g.trend, Some(-0.2));
        assert_eq!(g.predicted, None);
        assert!(!g.display_only);
        assert_eq!(g.sensor_age(), Duration::seconds(86_405));

        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let sample = g.to_sample(now).unwrap();
        assert_eq!(sample.timestamp, now - Duration::seconds(5));
        assert_eq!(sample.raw_value, 123.0);
        assert_eq!(g.activation(now), now - Duration::seconds(86_405));
    }

    #[test]
    fn test_g7_missing_glucose() {
        let msg = g7_glucose(100, 1, 0, 0xffff, 0x02);
        let g = decode_glucose_message(&msg).unwrap();
        assert_eq!(g.glucose, None);
        assert!(g.to_sample(OffsetDateTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_g7_warmup_is_not_a_sample() {
        let msg = g7_glucose(100, 1, 0, 140, 0x02);
        let g = decode_glucose_message(&msg).unwrap();
        assert_eq!(g.state, DexcomAlgorithmState::SensorWarmup);
        assert!(g.to_sample(OffsetDateTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_g7_rejected_status() {
        let mut msg = g7_glucose(100, 1, 0, 140, 0x06);
        msg[1] = 0x01;
        assert!(matches!(
            decode_glucose_message(&msg),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_g6_glucose_decoding() {
        let mut msg = vec![0x31, 0x00];
        msg.extend_from_slice(&7u32.to_le_bytes());
        msg.extend_from_slice(&5000u32.to_le_bytes());
        msg.extend_from_slice(&(0x1000u16 | 180).to_le_bytes());
        msg.push(0x07);
        msg.push(0x0a);
        let g = decode_glucose_message(&msg).unwrap();
        assert_eq!(g.sequence, 7);
        assert_eq!(g.device_time, 5000);
        assert_eq!(g.glucose, Some(180));
        assert!(g.display_only);
        assert_eq!(g.state, DexcomAlgorithmState::NeedsCalibration);
        assert_eq!(g.trend, Some(1.0));
    }

    #[test]
    fn test_wrong_opcode() {
        assert_eq!(
            decode_glucose_message(&[0x23, 0x00]),
            Err(ProtocolError::UnknownOpcode(vec![0x23]))
        );
        assert!(decode_glucose_message(&[]).is_err());
    }

    #[test]
    fn test_backfill_record() {
        let rec = decode_backfill_record(&g7_backfill(70_000, 150, 0x06))
            .unwrap()
            .unwrap();
        assert_eq!(rec.device_time, 70_000);
        assert_eq!(rec.glucose, 150);
        assert_eq!(rec.trend, None);
        let start = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(rec.to_sample(start).timestamp, start + Duration::seconds(70_000));

        assert_eq!(decode_backfill_record(&g7_backfill(70_000, 150, 0x02)).unwrap(), None);
        assert_eq!(decode_backfill_record(&g7_backfill(0, 150, 0x06)).unwrap(), None);
        assert!(decode_backfill_record(&[0u8; 8]).is_err());
    }

    fn stream_record(t: u32, g: u16, state: u8) -> Vec<u8> {
        let mut r = t.to_le_bytes().to_vec();
        r.extend_from_slice(&g.to_le_bytes());
        r.push(state);
        r.push(0);
        r
    }

    #[test]
    fn test_backfill_stream_reassembly() {
        let mut payload = vec![0xAA, 0xBB, 0xCC, 0xDD];
        payload.extend(stream_record(1000, 110, 0x06));
        payload.extend(stream_record(1300, 115, 0x03));
        payload.extend(stream_record(1600, 120, 0x07));

        let mut stream = BackfillStream::new();
        let (first, rest) = payload.split_at(18);
        let mut p1 = vec![1, 0];
        p1.extend_from_slice(first);
        let mut p2 = vec![2, 0];
        p2.extend_from_slice(rest);

        assert!(stream.push(&p1));
        assert!(!stream.push(&p1), "replayed sequence must be ignored");
        assert!(stream.push(&p2));

        let records = stream.decode();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device_time, 1000);
        assert_eq!(records[1].glucose, 120);
        assert!(stream.decode().is_empty());
    }

    #[test]
    fn test_backfill_stream_keeps_partial_record() {
        let mut stream = BackfillStream::new();
        let mut p1 = vec![1, 0, 0, 0, 0, 0];
        p1.extend_from_slice(&stream_record(500, 99, 0x06)[..5]);
        stream.push(&p1);
        assert!(stream.decode().is_empty());
        let mut p2 = vec![2, 0];
        p2.extend_from_slice(&stream_record(500, 99, 0x06)[5..]);
        stream.push(&p2);
        assert_eq!(stream.decode().len(), 1);
    }

    #[test]
    fn test_auth_challenge() {
        let ok = AuthChallengeRx::parse(&[0x05, 0x01, 0x01]).unwrap();
        assert!(ok.authenticated && ok.paired);
        let unpaired = AuthChallengeRx::parse(&[0x05, 0x01, 0x02]).unwrap();
        assert!(!unpaired.paired);
        let rejected = AuthChallengeRx::parse(&[0x05, 0x02, 0x01]).unwrap();
        assert!(!rejected.authenticated);
        assert!(AuthChallengeRx::parse(&[0x03, 0x01, 0x01]).is_err());
    }

    #[test]
    fn test_battery_and_time() {
        let bat = BatteryStatusRx::parse(&[0x23, 0, 0x2c, 0x01, 0x18, 0x01, 0x64, 0x00, 30, 33]).unwrap();
        assert_eq!(bat.voltage_a, 300);
        assert_eq!(bat.voltage_b, 280);
        assert_eq!(bat.runtime_days, 30);

        let mut t = vec![0x25, 0x00];
        t.extend_from_slice(&3600u32.to_le_bytes());
        t.extend_from_slice(&60u32.to_le_bytes());
        let time = TransmitterTimeRx::parse(&t).unwrap();
        let now = OffsetDateTime::from_unix_timestamp(10_000).unwrap();
        assert_eq!(time.activation(now), now - Duration::hours(1));
    }

    #[test]
    fn test_challenge_hash_matches_aes_ecb() {
        let hash = challenge_hash("4G1234", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(hash, [0x9f, 0xe1, 0x11, 0xae, 0xe3, 0xca, 0xe9, 0x16]);
        assert!(challenge_hash("4G123", &[0; 8]).is_err());
        assert!(challenge_hash("", &[0; 8]).is_err());
    }

    #[test]
    fn test_auth_exchange_messages() {
        let request = auth_request_tx([0xAA; 8]);
        assert_eq!(request.len(), 10);
        assert_eq!((request[0], request[9]), (0x01, 0x02));

        let mut rx = vec![0x03];
        rx.extend_from_slice(&[0x11; 8]);
        rx.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let parsed = AuthRequestRx::parse(&rx).unwrap();
        assert_eq!(parsed.challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(parsed.token_hash, [0x11; 8]);
        assert!(AuthRequestRx::parse(&rx[..16]).is_err());

        assert_eq!(auth_challenge_tx([9; 8])[0], 0x04);
        assert_eq!(keep_alive_tx(25), [0x06, 25]);
    }

    #[test]
    fn test_control_requests_carry_crc() {
        assert_eq!(control_request(DexcomOpcode::TransmitterTimeTx), vec![0x24, 0xe6, 0x64]);
        assert_eq!(control_request(DexcomOpcode::GlucoseTx), vec![0x30, 0x53, 0x36]);
        assert_eq!(control_request(DexcomOpcode::GlucoseG6Tx), vec![0x4e, 0x0a, 0xa9]);

        let backfill = backfill_tx(1000, 4000);
        assert_eq!(backfill.len(), 20);
        assert_eq!(&backfill[..4], &[0x50, 0x05, 0x02, 0x00]);
        assert_eq!(&backfill[4..8], &1000u32.to_le_bytes());
        assert_eq!(&backfill[8..12], &4000u32.to_le_bytes());
    }

    #[test]
    fn test_backfill_confirmation() {
        let mut rx = vec![0x51, 0x00, 0x01, 0x00];
        rx.extend_from_slice(&1000u32.to_le_bytes());
        rx.extend_from_slice(&4000u32.to_le_bytes());
        let parsed = GlucoseBackfillRx::parse(&rx).unwrap();
        assert_eq!((parsed.start_time, parsed.end_time), (1000, 4000));
        assert!(GlucoseBackfillRx::parse(&rx[..11]).is_err());
    }

    #[test]
    fn test_algorithm_state_classification() {
        assert!(DexcomAlgorithmState::Okay.is_reliable());
        assert!(!DexcomAlgorithmState::SensorWarmup.is_reliable());
        assert!(DexcomAlgorithmState::SessionExpired.is_terminal());
        assert!(!DexcomAlgorithmState::TemporarySensorIssue.is_terminal());
        assert_eq!(DexcomAlgorithmState::from_byte(0x17), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64)) {
                let _ = decode_glucose_message(&data);
                let _ = decode_backfill_record(&data);
                let _ = AuthChallengeRx::parse(&data);
                let _ = BatteryStatusRx::parse(&data);
                let _ = AuthRequestRx::parse(&data);
                let _ = GlucoseBackfillRx::parse(&data);
                let mut stream = BackfillStream::new();
                stream.push(&data);
                let _ = stream.decode();
            }
        }
    }
}
