//! Error types for wire decoding in cgm-types.

use thiserror::Error;

/// Errors that can occur when decoding transmitter payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in cgm-core).
///
/// All variants are recoverable: the owning session resets its buffers
/// and either resends the last request or waits for the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The leading opcode byte(s) did not match any known message.
    #[error("Unknown opcode: {0:02x?}")]
    UnknownOpcode(Vec<u8>),

    /// A CRC-16 covered region failed verification.
    #[error("CRC mismatch in {region} region")]
    CrcMismatch {
        /// Which region of the sensor memory failed.
        region: &'static str,
    },

    /// More bytes were received than the expected snapshot size.
    #[error("Snapshot overflow: {received} bytes exceeds expected {expected}")]
    SnapshotOverflow {
        /// Total bytes after the offending fragment.
        received: usize,
        /// Expected snapshot length.
        expected: usize,
    },

    /// The frame was too short or contained inconsistent fields.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl ProtocolError {
    /// Convenience constructor for a short frame.
    pub fn too_short(what: &str, expected: usize, actual: usize) -> Self {
        Self::MalformedFrame(format!(
            "{what} requires at least {expected} bytes, got {actual}"
        ))
    }
}

/// Conditions reported by the physical sensor.
///
/// These drop the current sample or cycle and are surfaced as
/// side-channel events; they never tear down the session.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum SensorError {
    /// No sensor is attached to (or in range of) the transmitter.
    #[error("Sensor not detected")]
    SensorNotDetected,

    /// The sensor has exceeded its maximum wear time.
    #[error("Sensor expired: age {age_minutes} min exceeds maximum {max_minutes} min")]
    SensorExpired {
        /// Reported sensor age in minutes.
        age_minutes: u32,
        /// Vendor maximum in minutes.
        max_minutes: u32,
    },

    /// A decoded value fell outside the physiological range.
    #[error("Glucose value {value:.1} mg/dL outside {min}-{max} mg/dL")]
    InvalidGlucoseRange {
        /// The rejected value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound (inclusive).
        max: f64,
    },

    /// The sensor is warming up, shut down or failed.
    #[error("Sensor not ready: {0}")]
    SensorNotReady(String),
}

/// Result type alias using cgm-types' ProtocolError type.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_short_message() {
        let err = ProtocolError::too_short("patch info", 18, 4);
        assert_eq!(
            err.to_string(),
            "Malformed frame: patch info requires at least 18 bytes, got 4"
        );
    }

    #[test]
    fn test_unknown_opcode_display_is_hex() {
        let err = ProtocolError::UnknownOpcode(vec![0xab, 0x01]);
        assert_eq!(err.to_string(), "Unknown opcode: [ab, 01]");
    }

    #[test]
    fn test_sensor_expired_display() {
        let err = SensorError::SensorExpired {
            age_minutes: 14401,
            max_minutes: 14400,
        };
        assert!(err.to_string().contains("14401"));
        assert!(err.to_string().contains("14400"));
    }
}
