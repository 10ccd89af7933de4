//! Bubble and Atom NFC-to-BLE bridge messages.
//!
//! Both bridges speak the same protocol over the Nordic UART service. Every
//! notification starts with a response byte. A sensor image arrives as a
//! run of data packets, each carrying four bytes of bridge header followed
//! by a slice of the 344-byte Libre image. The Atom additionally reports
//! the sensor's patch info, which identifies the Libre generation.

use crate::crc::LIBRE1_IMAGE_LEN;
use crate::error::{ProtocolError, Result};
use crate::types::LibreFamily;

/// Bytes of bridge header in front of every data packet payload.
pub const PACKET_HEADER_LEN: usize = 4;

/// Length of the assembled sensor image.
pub const IMAGE_LEN: usize = LIBRE1_IMAGE_LEN;

/// Which bridge of the family is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeModel {
    Bubble,
    Atom,
}

impl BridgeModel {
    /// Ask the bridge to read the sensor and stream the image.
    #[must_use]
    pub fn start_reading(&self) -> [u8; 3] {
        match self {
            BridgeModel::Bubble => [0x00, 0x00, 0x05],
            BridgeModel::Atom => [0x00, 0x01, 0x05],
        }
    }

    /// Acknowledge a transmitter info message; the bridge then sends the
    /// sensor identity and the image.
    #[must_use]
    pub fn info_ack(&self) -> [u8; 6] {
        match self {
            BridgeModel::Bubble => [0x02, 0x00, 0x00, 0x00, 0x00, 0x2B],
            BridgeModel::Atom => [0x02, 0x01, 0x00, 0x00, 0x00, 0x2B],
        }
    }
}

/// First byte of a bridge notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BubbleResponse {
    /// A slice of the sensor image.
    DataPacket,
    /// Battery and version report that precedes every reading.
    TransmitterInfo,
    /// No sensor in range.
    NoSensor,
    /// NFC UID of the sensor.
    SensorUid,
    /// Patch info of the sensor (Atom).
    PatchInfo,
    /// Anything else.
    Unknown(u8),
}

impl BubbleResponse {
    /// Classify a notification by its first byte.
    #[must_use]
    pub fn decode(first: u8) -> Self {
        match first {
            0x82 => BubbleResponse::DataPacket,
            0x80 => BubbleResponse::TransmitterInfo,
            0xBF => BubbleResponse::NoSensor,
            0xC0 => BubbleResponse::SensorUid,
            0xC1 => BubbleResponse::PatchInfo,
            other => BubbleResponse::Unknown(other),
        }
    }
}

/// Parsed transmitter info message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitterInfo {
    /// Bridge battery in percent.
    pub battery_percent: u8,
    /// Firmware major and minor bytes.
    pub firmware_version: (u8, u8),
    /// Firmware version as displayed by the vendor app.
    pub firmware: String,
    /// Hardware version as displayed by the vendor app.
    pub hardware: String,
}

impl TransmitterInfo {
    /// Minimum frame length.
    pub const LEN: usize = 6;

    /// Parse a transmitter info message. The Bubble prints its versions in
    /// decimal, the Atom in hex.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedFrame`] for short frames.
    pub fn parse(bytes: &[u8], model: BridgeModel) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::too_short("bridge info", Self::LEN, bytes.len()));
        }
        let version = |a: u8, b: u8| match model {
            BridgeModel::Bubble => format!("{a}.{b}"),
            BridgeModel::Atom => format!("{a:02x}.{b:02x}"),
        };
        let n = bytes.len();
        Ok(Self {
            battery_percent: bytes[4],
            firmware_version: (bytes[2], bytes[3]),
            firmware: version(bytes[2], bytes[3]),
            hardware: version(bytes[n - 2], bytes[n - 1]),
        })
    }
}

/// Extract the sensor UID from a [`BubbleResponse::SensorUid`] message.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if the UID is cut short.
pub fn sensor_uid(bytes: &[u8]) -> Result<[u8; 8]> {
    let Some(slice) = bytes.get(2..10) else {
        return Err(ProtocolError::too_short("sensor uid", 10, bytes.len()));
    };
    let mut uid = [0u8; 8];
    uid.copy_from_slice(slice);
    Ok(uid)
}

/// Firmware from which the Atom moved the patch info two bytes back.
const PATCH_INFO_MOVED_IN: (u8, u8) = (0x01, 0x35);

/// Extract the six patch info bytes from a [`BubbleResponse::PatchInfo`]
/// message; their position depends on the bridge firmware.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if the patch info is cut short.
pub fn patch_info(bytes: &[u8], firmware_version: (u8, u8)) -> Result<[u8; 6]> {
    let start = if firmware_version < PATCH_INFO_MOVED_IN { 3 } else { 5 };
    let Some(slice) = bytes.get(start..start + 6) else {
        return Err(ProtocolError::too_short("patch info", start + 6, bytes.len()));
    };
    let mut info = [0u8; 6];
    info.copy_from_slice(slice);
    Ok(info)
}

/// Libre generation announced by the patch info, if recognised.
#[must_use]
pub fn family_from_patch_info(info: &[u8; 6]) -> Option<LibreFamily> {
    LibreFamily::from_patch_info(info[0])
}

/// Image bytes carried by a data packet.
#[must_use]
pub fn packet_payload(bytes: &[u8]) -> &[u8] {
    bytes.get(PACKET_HEADER_LEN..).unwrap_or_default()
}
