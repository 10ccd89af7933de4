//! Transmitter event broadcast.
//!
//! Every lifecycle change and side-channel reading (battery, sensor age,
//! new sensor) is published as a [`CgmEvent`]. Events are informational;
//! nothing in the sample path waits for a subscriber.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use cgm_types::TransmitterKind;

use crate::error::AuthenticationError;
use crate::link::ConnectionState;

/// Peripheral identifier for events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Platform peripheral identifier (MAC address or UUID).
    pub id: String,
    /// Advertised name if known.
    pub name: Option<String>,
    /// Transmitter family if known.
    pub kind: Option<TransmitterKind>,
}

impl DeviceId {
    /// Create a new device ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: None,
        }
    }

    /// Create a device ID with name, inferring the family from it.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            kind: TransmitterKind::from_name(&name),
            name: Some(name),
        }
    }
}

/// Events emitted by the link manager and the coordinator.
///
/// All events are serializable for logging and IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CgmEvent {
    /// The link state machine moved.
    StateChanged { state: ConnectionState },
    /// A matching peripheral was seen while scanning.
    Discovered { device: DeviceId, rssi: Option<i16> },
    /// Services discovered and notifications enabled.
    Connected { device: DeviceId },
    /// The link dropped.
    Disconnected {
        device: DeviceId,
        will_reconnect: bool,
    },
    /// Samples passed reconciliation and were stored.
    SamplesAccepted {
        sensor_id: Option<String>,
        count: usize,
        #[serde(with = "time::serde::rfc3339")]
        newest: OffsetDateTime,
    },
    /// A different sensor is attached to the transmitter.
    NewSensor { serial: Option<String> },
    /// Transmitter battery level.
    BatteryLevel { percent: u8 },
    /// Sensor age in minutes.
    SensorAge { minutes: u32 },
    /// Sensor-side problem (not detected, expired, not ready).
    SensorError { message: String },
    /// The transmitter refused this receiver and was put on cooldown.
    Rejected {
        device: DeviceId,
        reason: AuthenticationError,
    },
    /// A reconnection attempt is scheduled.
    ReconnectStarted { device: DeviceId, attempt: u32 },
}

/// Sender for events.
pub type EventSender = broadcast::Sender<CgmEvent>;

/// Receiver for events.
pub type EventReceiver = broadcast::Receiver<CgmEvent>;

/// Fan-out of [`CgmEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: CgmEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
