//! Blucon (Ambrosia) NFC-to-BLE bridge messages.
//!
//! The Blucon reads a Libre sensor over NFC and answers a fixed command
//! sequence. Messages are identified by a byte prefix, which may be longer
//! than one byte; decoding picks the longest matching prefix.

use core::fmt;

use time::{Duration, OffsetDateTime};

use crate::crc::LIBRE1_IMAGE_LEN;
use crate::error::{ProtocolError, Result};
use crate::serial::libre_serial_number;
use crate::types::{LibreFamily, SensorState};

/// Bytes of historic data requested by [`BluconOpcode::GetHistoricData`]
/// (blocks `0x00..=0x2b`, eight bytes each).
pub const HISTORIC_IMAGE_LEN: usize = 44 * 8;

/// Number of header bytes before the payload of a multi-block response.
pub const MULTI_BLOCK_HEADER_LEN: usize = 4;

/// How long after `WakeUpResponse` an ack still means "continue".
pub const ACK_WINDOW: Duration = Duration::seconds(5);

/// How long a now-block response stays valid after its request.
pub const NOW_BLOCK_WINDOW: Duration = Duration::seconds(2);

/// Last reading age beyond which the full history is requested.
pub const HISTORIC_THRESHOLD: Duration = Duration::seconds(5 * 60 + 10);

/// Blucon message kinds, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BluconOpcode {
    // Received from the Blucon.
    WakeUpRequest,
    GetPatchInfoResponse,
    AckResponse,
    Unknown1Response,
    Unknown2Response,
    MultipleBlockResponse,
    SingleBlockResponse,
    Error14,
    SensorNotDetected,
    BatteryLow1,
    BatteryLow2,

    // Sent to the Blucon.
    WakeUpResponse,
    Sleep,
    GetPatchInfoRequest,
    Unknown1Command,
    Unknown2Command,
    GetHistoricData,
    GetNowDataIndex,
    SingleBlockInfoPrefix,
}

impl BluconOpcode {
    const ALL: [BluconOpcode; 19] = [
        BluconOpcode::WakeUpRequest,
        BluconOpcode::GetPatchInfoResponse,
        BluconOpcode::AckResponse,
        BluconOpcode::Unknown1Response,
        BluconOpcode::Unknown2Response,
        BluconOpcode::MultipleBlockResponse,
        BluconOpcode::SingleBlockResponse,
        BluconOpcode::Error14,
        BluconOpcode::SensorNotDetected,
        BluconOpcode::BatteryLow1,
        BluconOpcode::BatteryLow2,
        BluconOpcode::WakeUpResponse,
        BluconOpcode::Sleep,
        BluconOpcode::GetPatchInfoRequest,
        BluconOpcode::Unknown1Command,
        BluconOpcode::Unknown2Command,
        BluconOpcode::GetHistoricData,
        BluconOpcode::GetNowDataIndex,
        BluconOpcode::SingleBlockInfoPrefix,
    ];

    /// Byte prefix identifying this message.
    #[must_use]
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            BluconOpcode::WakeUpRequest => &[0xcb, 0x01, 0x00, 0x00],
            BluconOpcode::GetPatchInfoResponse => &[0x8b, 0xd9],
            BluconOpcode::AckResponse => &[0x8b, 0x0a, 0x00],
            BluconOpcode::Unknown1Response => &[0x8b, 0xdb],
            BluconOpcode::Unknown2Response => &[0x8b, 0xda],
            BluconOpcode::MultipleBlockResponse => &[0x8b, 0xdf],
            BluconOpcode::SingleBlockResponse => &[0x8b, 0xde],
            BluconOpcode::Error14 => &[0x8b, 0x1a, 0x02, 0x00, 0x14],
            BluconOpcode::SensorNotDetected => &[0x8b, 0x1a, 0x02, 0x00, 0x0f],
            BluconOpcode::BatteryLow1 => &[0xcb, 0x02, 0x00, 0x00],
            BluconOpcode::BatteryLow2 => &[0xcb, 0xdb, 0x00, 0x00],
            BluconOpcode::WakeUpResponse => &[0x81, 0x0a, 0x00],
            BluconOpcode::Sleep => &[0x01, 0x0c, 0x0e, 0x00],
            BluconOpcode::GetPatchInfoRequest => &[0x01, 0x0d, 0x09, 0x00],
            BluconOpcode::Unknown1Command => &[0x01, 0x0d, 0x0b, 0x00],
            BluconOpcode::Unknown2Command => &[0x01, 0x0d, 0x0a, 0x00],
            BluconOpcode::GetHistoricData => &[0x01, 0x0d, 0x0f, 0x02, 0x00, 0x2b],
            BluconOpcode::GetNowDataIndex => &[0x01, 0x0d, 0x0e, 0x01, 0x03],
            BluconOpcode::SingleBlockInfoPrefix => &[0x01, 0x0d, 0x0e, 0x01],
        }
    }

    /// Whether the app sends this message (as opposed to receiving it).
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            BluconOpcode::WakeUpResponse
                | BluconOpcode::Sleep
                | BluconOpcode::GetPatchInfoRequest
                | BluconOpcode::Unknown1Command
                | BluconOpcode::Unknown2Command
                | BluconOpcode::GetHistoricData
                | BluconOpcode::GetNowDataIndex
                | BluconOpcode::SingleBlockInfoPrefix
        )
    }

    /// Identify a message by its longest matching prefix.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .filter(|op| bytes.starts_with(op.bytes()))
            .max_by_key(|op| op.bytes().len())
            .copied()
    }
}

impl fmt::Display for BluconOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (")?;
        for b in self.bytes() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Parsed `GetPatchInfoResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchInfo {
    /// Sensor NFC UID.
    pub uid: [u8; 8],
    /// Printed sensor serial number.
    pub serial: String,
    /// Sensor lifecycle state.
    pub state: SensorState,
}

impl PatchInfo {
    /// Minimum frame length (the state byte is at index 17).
    pub const LEN: usize = 18;

    /// Parse a patch info response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedFrame`] for frames that do not
    /// reach the state byte.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::too_short("patch info", Self::LEN, bytes.len()));
        }
        let mut uid = [0u8; 8];
        uid.copy_from_slice(&bytes[3..11]);
        Ok(Self {
            uid,
            serial: libre_serial_number(&uid, LibreFamily::Libre1),
            state: SensorState::from(bytes[17]),
        })
    }
}

/// Build the single-block request for the newest trend slot.
///
/// `index_response` is the `SingleBlockResponse` answering
/// [`BluconOpcode::GetNowDataIndex`]; byte 5 holds the trend cursor.
/// Returns the request bytes and the offset of the slot within the block.
#[must_use]
pub fn now_block_request(index_response: &[u8]) -> Option<(Vec<u8>, usize)> {
    let cursor = i32::from(*index_response.get(5)?);
    // Byte position of the newest trend record in the sensor body.
    let mut position = cursor * 6 + 4;
    position -= 6;
    if position < 4 {
        position += 96;
    }
    let block = 3 + position / 8;
    let offset = usize::try_from(position % 8).ok()?;

    let mut request = BluconOpcode::SingleBlockInfoPrefix.bytes().to_vec();
    request.push(u8::try_from(block).ok()?);
    Some((request, offset))
}

/// Extract the raw glucose value of the newest trend record.
#[must_use]
pub fn now_glucose_raw(block_response: &[u8], offset: usize) -> Option<u16> {
    let base = 3 + offset;
    let low = *block_response.get(base)?;
    let high = *block_response.get(base + 1)?;
    Some((u16::from(high & 0x0f) << 8) | u16::from(low))
}

/// Battery percentage implied by a low-battery message, if any.
///
/// The Blucon never reports a real level; an `Unknown2Response` starting
/// with `8bda02` means 5 %, and the two unsolicited low-battery messages
/// mean 3 % and 2 %.
#[must_use]
pub fn battery_indication(bytes: &[u8]) -> Option<u8> {
    if bytes.starts_with(&[0x8b, 0xda, 0x02]) {
        return Some(5);
    }
    match BluconOpcode::decode(bytes)? {
        BluconOpcode::BatteryLow1 => Some(3),
        BluconOpcode::BatteryLow2 => Some(2),
        _ => None,
    }
}

/// Whether the full history should be requested given the last accepted reading.
///
/// An unknown last reading counts as stale.
#[must_use]
pub fn needs_historic(last_accepted: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    last_accepted.is_none_or(|last| now - last > HISTORIC_THRESHOLD)
}

/// Payload of one multi-block response (after the 4-byte header).
#[must_use]
pub fn multi_block_payload(bytes: &[u8]) -> Option<&[u8]> {
    bytes.get(MULTI_BLOCK_HEADER_LEN..)
}

/// Libre image within an assembled historic response.
#[must_use]
pub fn historic_image(assembled: &[u8]) -> Option<&[u8]> {
    assembled.get(..LIBRE1_IMAGE_LEN)
}
