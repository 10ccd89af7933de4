//! Error types for cgm-core.
//!
//! Errors are grouped by the layer that raises them: the radio link, the
//! byte-level codec, the sensor itself and transmitter authentication.
//!
//! # Retry vs reconnect
//!
//! | Error | Strategy |
//! |-------|----------|
//! | [`Error::Timeout`] | Retry |
//! | [`Error::Bluetooth`] | Retry, then reconnect |
//! | [`LinkError::Disconnected`] | Reconnect (the link manager does this by itself) |
//! | [`LinkError::ConnectTimeout`] | Retry with backoff |
//! | [`LinkError::WriteFailed`] | Retry |
//! | [`Error::Protocol`] | Drop the frame, keep the link |
//! | [`Error::Sensor`] | Report, do not retry |
//! | [`Error::Authentication`] | Reject the transmitter temporarily |
//! | [`Error::InvalidConfig`] | Fix configuration and restart |
//!
//! [`Error::is_retryable`] encodes the left column for [`crate::with_retry`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use cgm_types::{ProtocolError, SensorError};

/// Failures of the BLE link itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// Adapter missing, powered off or resetting.
    #[error("Bluetooth unavailable")]
    BluetoothUnavailable,

    /// The OS denied Bluetooth access.
    #[error("Bluetooth access not authorized")]
    Unauthorized,

    /// A connection attempt did not complete in time.
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// A required service or characteristic was not found.
    #[error("GATT discovery failed: {0} not found")]
    GattDiscoveryFailed(Uuid),

    /// A characteristic write was rejected.
    #[error("Write to characteristic {characteristic} failed: {reason}")]
    WriteFailed {
        /// Target characteristic.
        characteristic: Uuid,
        /// Backend message.
        reason: String,
    },

    /// No peripheral is connected.
    #[error("Not connected")]
    Disconnected,

    /// A connection is already open or in progress.
    #[error("Already connected")]
    AlreadyConnected,

    /// A scan is already running.
    #[error("Already scanning")]
    AlreadyScanning,

    /// The peripheral is on the temporary rejection list.
    #[error("Device {id} rejected for another {remaining:?}")]
    DeviceRejected {
        /// Peripheral identity.
        id: String,
        /// Time left on the cooldown.
        remaining: Duration,
    },

    /// The peripheral is not known to the radio.
    #[error("Device not found: {0}")]
    NotFound(String),
}

/// Reasons a transmitter refuses to talk to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuthenticationError {
    /// The transmitter is not bonded at the link layer.
    #[error("Transmitter requires pairing")]
    PairingRequired,

    /// The transmitter is bonded to a different receiver.
    #[error("Transmitter is not bonded to this receiver")]
    NotBondedByThisApp,
}

/// Errors that can occur while talking to a CGM transmitter.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// BLE link failure.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Undecodable payload.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sensor-side condition (not detected, expired, not ready).
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    /// Transmitter authentication failure.
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Bluetooth backend error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a write failure.
    pub fn write_failed(characteristic: Uuid, reason: impl Into<String>) -> Self {
        Self::Link(LinkError::WriteFailed {
            characteristic,
            reason: reason.into(),
        })
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Bluetooth(_) | Error::Io(_) => true,
            Error::Link(link) => matches!(
                link,
                LinkError::ConnectTimeout(_)
                    | LinkError::GattDiscoveryFailed(_)
                    | LinkError::WriteFailed { .. }
                    | LinkError::Disconnected
                    | LinkError::NotFound(_)
            ),
            Error::Protocol(_)
            | Error::Sensor(_)
            | Error::Authentication(_)
            | Error::InvalidConfig(_)
            | Error::Cancelled => false,
        }
    }
}

/// Result type alias using cgm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("connect", Duration::from_secs(5));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("5s"));

        let err: Error = LinkError::Disconnected.into();
        assert_eq!(err.to_string(), "Not connected");

        let err: Error = AuthenticationError::PairingRequired.into();
        assert_eq!(err.to_string(), "Authentication failed: Transmitter requires pairing");

        let err = Error::write_failed(cgm_types::uuids::BLUCON_WRITE, "gatt busy");
        assert!(err.to_string().contains("gatt busy"));
    }

    #[test]
    fn test_codec_errors_convert() {
        let err: Error = ProtocolError::too_short("frame", 4, 2).into();
        assert!(matches!(err, Error::Protocol(_)));
        let err: Error = SensorError::SensorNotDetected.into();
        assert!(matches!(err, Error::Sensor(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::timeout("x", Duration::from_secs(1)).is_retryable());
        assert!(Error::Link(LinkError::ConnectTimeout("a".into())).is_retryable());
        assert!(Error::Link(LinkError::Disconnected).is_retryable());
        assert!(!Error::Link(LinkError::BluetoothUnavailable).is_retryable());
        assert!(
            !Error::Link(LinkError::DeviceRejected {
                id: "a".into(),
                remaining: Duration::from_secs(10),
            })
            .is_retryable()
        );
        assert!(!Error::Protocol(ProtocolError::MalformedFrame("x".into())).is_retryable());
        assert!(!Error::Authentication(AuthenticationError::NotBondedByThisApp).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
