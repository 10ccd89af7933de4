//! MiaoMiao NFC-to-BLE bridge messages.

use crate::crc::LIBRE1_IMAGE_LEN;
use crate::error::{ProtocolError, Result};
use crate::serial::serial_from_slice;
use crate::types::LibreFamily;

/// Ask the bridge to read the sensor and stream the result.
pub const START_READING: u8 = 0xF0;

/// Confirm that a newly detected sensor may be used.
pub const ALLOW_NEW_SENSOR: [u8; 2] = [0xD3, 0x01];

/// Change the bridge's reading interval; followed by the interval in minutes.
pub const SET_INTERVAL: u8 = 0xD1;

/// Bytes of bridge header before the Libre image.
pub const HEADER_LEN: usize = 18;

/// Minimum length of a complete data packet.
pub const PACKET_LEN: usize = 363;

/// First byte of a bridge notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MiaoMiaoResponse {
    /// Start of a sensor data packet.
    DataPacket,
    /// A different sensor was detected; awaiting confirmation.
    NewSensor,
    /// No sensor in range.
    NoSensor,
    /// Reply to a reading-interval change.
    FrequencyChanged,
    /// Anything else.
    Unknown(u8),
}

impl MiaoMiaoResponse {
    /// Classify a notification by its first byte.
    #[must_use]
    pub fn decode(first: u8) -> Self {
        match first {
            0x28 => MiaoMiaoResponse::DataPacket,
            0x32 => MiaoMiaoResponse::NewSensor,
            0x34 => MiaoMiaoResponse::NoSensor,
            0xD1 => MiaoMiaoResponse::FrequencyChanged,
            other => MiaoMiaoResponse::Unknown(other),
        }
    }
}

/// A complete data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiaoMiaoPacket {
    /// Bridge battery in percent.
    pub battery_percent: u8,
    /// Firmware version, hex encoded.
    pub firmware: String,
    /// Hardware version, hex encoded.
    pub hardware: String,
    /// Sensor NFC UID.
    pub uid: [u8; 8],
    /// Libre memory image (`HEADER_LEN..HEADER_LEN + 344`).
    pub libre_data: Vec<u8>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl MiaoMiaoPacket {
    /// Parse an assembled data packet.
    ///
    /// CRC verification is left to the caller, which decides whether to
    /// ask for a resend.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedFrame`] if fewer than
    /// [`PACKET_LEN`] bytes are supplied or the packet is not a data packet.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_LEN {
            return Err(ProtocolError::too_short("MiaoMiao packet", PACKET_LEN, buf.len()));
        }
        if MiaoMiaoResponse::decode(buf[0]) != MiaoMiaoResponse::DataPacket {
            return Err(ProtocolError::UnknownOpcode(vec![buf[0]]));
        }
        let mut uid = [0u8; 8];
        uid.copy_from_slice(&buf[5..13]);
        Ok(Self {
            battery_percent: buf[13],
            firmware: hex(&buf[14..16]),
            hardware: hex(&buf[16..18]),
            uid,
            libre_data: buf[HEADER_LEN..HEADER_LEN + LIBRE1_IMAGE_LEN].to_vec(),
        })
    }

    /// Serial number of the sensor the packet was read from.
    #[must_use]
    pub fn serial(&self) -> Option<String> {
        serial_from_slice(&self.uid, LibreFamily::Libre1)
    }
}

/// Command changing the reading interval to `minutes`.
#[must_use]
pub fn set_interval_command(minutes: u8) -> [u8; 2] {
    [SET_INTERVAL, minutes]
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Wrap a Libre image in a bridge data packet.
    pub fn packet(image: &[u8], battery: u8) -> Vec<u8> {
        let mut buf = vec![0x28, 0x01, 0x6b, 0x00, 0x00];
        buf.extend_from_slice(&[0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0]);
        buf.push(battery);
        buf.extend_from_slice(&[0x00, 0x39, 0x00, 0x01]);
        buf.extend_from_slice(image);
        buf.resize(PACKET_LEN, 0x29);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::packet;
    use super::*;
    use crate::crc::verify_crc16;

    #[test]
    fn test_response_decoding() {
        assert_eq!(MiaoMiaoResponse::decode(0x28), MiaoMiaoResponse::DataPacket);
        assert_eq!(MiaoMiaoResponse::decode(0x32), MiaoMiaoResponse::NewSensor);
        assert_eq!(MiaoMiaoResponse::decode(0x34), MiaoMiaoResponse::NoSensor);
        assert_eq!(MiaoMiaoResponse::decode(0xD1), MiaoMiaoResponse::FrequencyChanged);
        assert_eq!(MiaoMiaoResponse::decode(0x00), MiaoMiaoResponse::Unknown(0x00));
    }

    #[test]
    fn test_packet_fields() {
        let image = crate::libre::fixtures::blank_image(0x03, 1000, 0, 0);
        let buf = packet(&image, 87);
        assert!(verify_crc16(&buf, HEADER_LEN));

        let p = MiaoMiaoPacket::parse(&buf).unwrap();
        assert_eq!(p.battery_percent, 87);
        assert_eq!(p.firmware, "0039");
        assert_eq!(p.hardware, "0001");
        assert_eq!(p.libre_data, image);
        assert_eq!(p.serial().as_deref(), Some("0M00009DHCR"));
    }

    #[test]
    fn test_short_packet() {
        assert!(MiaoMiaoPacket::parse(&[0x28; 362]).is_err());
        assert!(matches!(
            MiaoMiaoPacket::parse(&[0x32; 363]),
            Err(ProtocolError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn test_interval_command() {
        assert_eq!(set_interval_command(5), [0xD1, 0x05]);
    }
}
