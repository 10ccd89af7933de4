//! Per-vendor protocol state machines.
//!
//! A [`DeviceSession`] never touches the radio. The coordinator feeds it
//! link events and expired timers; the session answers with
//! [`SessionAction`]s (writes, batches, side-channel events, timer
//! requests) which the coordinator carries out in order. This keeps every
//! vendor state machine testable with plain byte vectors and a fixed
//! instant.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use cgm_types::crc::{CrcLayout, first_invalid_region};
use cgm_types::libre::WARMUP_MINUTES;
use cgm_types::{
    GlucoseSample, ProtocolError, RingOptions, SensorError, SensorState, TransmitterKind,
    parse_glucose_ring,
};

use crate::config::TransmitterConfig;
use crate::error::AuthenticationError;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

pub mod blucon;
pub mod bubble;
pub mod dexcom;
pub mod g5;
pub mod miaomiao;

pub use blucon::BluconSession;
pub use bubble::BubbleSession;
pub use dexcom::DexcomSession;
pub use g5::DexcomG5Session;
pub use miaomiao::MiaoMiaoSession;

/// Side-channel information for the alerting collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Serial number of the sensor currently read. The coordinator decides
    /// whether it is new.
    SensorSerial(String),
    /// The transmitter itself reported a sensor change.
    NewSensorDetected,
    /// Transmitter battery in percent.
    BatteryLevel(u8),
    /// Minutes since sensor activation.
    SensorAge(u32),
    /// A sensor condition that dropped this cycle's data.
    Sensor(SensorError),
    /// A wire-level problem the session recovered from.
    Protocol(ProtocolError),
    /// Bridge firmware and hardware revisions.
    Firmware { firmware: String, hardware: String },
}

/// One decoded batch, in no particular order.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Sensor serial number or transmitter ID the samples belong to.
    pub sensor_id: String,
    pub samples: Vec<GlucoseSample>,
    /// Sensor age when the batch was read, if known.
    pub sensor_age_minutes: Option<u32>,
    /// Maximum wear time for this sensor family.
    pub max_sensor_age_minutes: Option<u32>,
}

/// What the session wants done next.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write to a characteristic.
    Write {
        characteristic: Uuid,
        bytes: Vec<u8>,
        require_ack: bool,
    },
    /// Hand a batch to the reconciler.
    Deliver(Batch),
    /// Forward a side-channel event.
    Event(SessionEvent),
    /// Arm a timer; replaces one of the same kind.
    SetTimer(TimerKind, Duration),
    /// Disarm a timer.
    CancelTimer(TimerKind),
    /// Drop the link.
    Disconnect { reconnect: bool },
    /// The transmitter belongs to another host; forget it and scan on.
    Reject(AuthenticationError),
    /// The transmitter accepted this host.
    Authenticated,
    /// Nothing more is expected in this connection cycle.
    CycleComplete,
}

/// What to do with the link once a cycle completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Keep the link; the transmitter streams or disconnects on its own.
    StayConnected,
    /// Disconnect and reconnect for the next cycle.
    DisconnectAfterCycle,
}

/// A vendor protocol state machine.
pub trait DeviceSession: Send {
    /// Transmitter family.
    fn kind(&self) -> TransmitterKind;

    /// GATT layout and scan hints.
    fn link_profile(&self) -> LinkProfile;

    /// Link handling after [`SessionAction::CycleComplete`].
    fn link_policy(&self) -> LinkPolicy;

    /// Sensor identity known before any data arrives, for transmitters
    /// whose sensor is fixed to the transmitter.
    fn sensor_id_hint(&self) -> Option<String> {
        None
    }

    /// The newest accepted sample, as known to the coordinator.
    fn set_last_accepted(&mut self, last: Option<OffsetDateTime>);

    /// Characteristics are subscribed.
    fn handle_connected(&mut self, now: OffsetDateTime);

    /// A notification arrived.
    fn handle_value(&mut self, now: OffsetDateTime, characteristic: Uuid, bytes: &[u8]);

    /// A timer armed through [`SessionAction::SetTimer`] expired.
    fn handle_timeout(&mut self, now: OffsetDateTime, timer: TimerKind);

    /// The link dropped. Buffered data may still be delivered.
    fn handle_disconnected(&mut self, now: OffsetDateTime);

    /// Next pending action.
    fn poll_action(&mut self) -> Option<SessionAction>;

    /// Earliest timer the session is waiting for.
    fn poll_timeout(&self) -> Option<(TimerKind, OffsetDateTime)>;

    /// Drop all per-connection state: buffers, counters, pending markers
    /// and queued actions.
    fn reset(&mut self);
}

/// Build the session for a configured transmitter family.
pub fn for_config(config: &TransmitterConfig) -> Box<dyn DeviceSession> {
    match config.kind {
        TransmitterKind::Blucon => Box::new(BluconSession::new(config)),
        TransmitterKind::MiaoMiao => Box::new(MiaoMiaoSession::new(config)),
        TransmitterKind::Bubble | TransmitterKind::Atom => Box::new(BubbleSession::new(config)),
        TransmitterKind::DexcomG5 | TransmitterKind::DexcomG6 => {
            Box::new(DexcomG5Session::new(config))
        }
        TransmitterKind::DexcomG7 => Box::new(DexcomSession::new(config)),
        _ => unreachable!("every TransmitterKind variant is matched above"),
    }
}

/// Action queue and timer bookkeeping shared by all sessions.
#[derive(Debug, Default)]
pub(crate) struct SessionCore {
    actions: VecDeque<SessionAction>,
    timers: HashMap<TimerKind, OffsetDateTime>,
}

impl SessionCore {
    pub(crate) fn push(&mut self, action: SessionAction) {
        self.actions.push_back(action);
    }

    pub(crate) fn write(&mut self, characteristic: Uuid, bytes: impl Into<Vec<u8>>, require_ack: bool) {
        self.push(SessionAction::Write {
            characteristic,
            bytes: bytes.into(),
            require_ack,
        });
    }

    pub(crate) fn event(&mut self, event: SessionEvent) {
        self.push(SessionAction::Event(event));
    }

    pub(crate) fn set_timer(&mut self, now: OffsetDateTime, kind: TimerKind, after: Duration) {
        self.timers.insert(kind, now + after);
        self.push(SessionAction::SetTimer(kind, after));
    }

    pub(crate) fn cancel_timer(&mut self, kind: TimerKind) {
        if self.timers.remove(&kind).is_some() {
            self.push(SessionAction::CancelTimer(kind));
        }
    }

    /// Forget a timer that fired.
    pub(crate) fn fired(&mut self, kind: TimerKind) -> bool {
        self.timers.remove(&kind).is_some()
    }

    pub(crate) fn poll(&mut self) -> Option<SessionAction> {
        self.actions.pop_front()
    }

    pub(crate) fn next_timeout(&self) -> Option<(TimerKind, OffsetDateTime)> {
        self.timers
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }

    pub(crate) fn clear(&mut self) {
        self.actions.clear();
        self.timers.clear();
    }
}

/// Ring decoding parameters taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LibreDecoding {
    pub(crate) min_spacing: time::Duration,
    pub(crate) tolerance: time::Duration,
    pub(crate) max_sensor_age_minutes: u32,
}

impl LibreDecoding {
    pub(crate) fn from_config(config: &TransmitterConfig) -> Self {
        Self {
            min_spacing: config.sample_spacing(),
            tolerance: config.dedupe_tolerance(),
            max_sensor_age_minutes: config.max_sensor_age_minutes(),
        }
    }
}

/// Result of decoding one Libre memory image.
#[derive(Debug)]
pub(crate) enum LibreImage {
    /// CRC failed; nothing from the image may be used.
    Corrupt(ProtocolError),
    /// The sensor is not producing readings.
    NotReady { state: SensorState, age_minutes: u32 },
    /// Decoded batch.
    Batch(Batch),
}

/// CRC-gate, then parse a Libre 1 image found at `header_offset` in `buffer`.
pub(crate) fn decode_libre_image(
    buffer: &[u8],
    header_offset: usize,
    sensor_id: &str,
    now: OffsetDateTime,
    last_accepted: Option<OffsetDateTime>,
    decoding: &LibreDecoding,
) -> LibreImage {
    if let Some(region) = first_invalid_region(buffer, header_offset, CrcLayout::Libre1) {
        warn!(region, "CRC mismatch in sensor memory image");
        return LibreImage::Corrupt(ProtocolError::CrcMismatch { region });
    }
    let image = &buffer[header_offset..];
    let options = RingOptions {
        now,
        known_latest: last_accepted,
        min_spacing: decoding.min_spacing,
        tolerance: decoding.tolerance,
    };
    let ring = match parse_glucose_ring(image, &options) {
        Ok(ring) => ring,
        Err(e) => return LibreImage::Corrupt(e),
    };
    let age_minutes = u32::from(ring.sensor_age_minutes);
    if !ring.sensor_state.has_readings() || ring.sensor_age_minutes < WARMUP_MINUTES {
        return LibreImage::NotReady {
            state: ring.sensor_state,
            age_minutes,
        };
    }
    debug!(
        trend = ring.trend.len(),
        history = ring.history.len(),
        age_minutes,
        "decoded sensor memory image"
    );
    LibreImage::Batch(Batch {
        sensor_id: sensor_id.to_string(),
        samples: ring.into_samples(),
        sensor_age_minutes: Some(age_minutes),
        max_sensor_age_minutes: Some(decoding.max_sensor_age_minutes),
    })
}

/// Queue the actions for a decoded Libre image. Corruption is returned so
/// the caller can ask for a resend.
pub(crate) fn emit_libre_image(core: &mut SessionCore, image: LibreImage) -> Result<(), ProtocolError> {
    match image {
        LibreImage::Corrupt(e) => {
            core.event(SessionEvent::Protocol(e.clone()));
            Err(e)
        }
        LibreImage::NotReady { state, age_minutes } => {
            core.event(SessionEvent::SensorAge(age_minutes));
            core.event(SessionEvent::Sensor(SensorError::SensorNotReady(state.to_string())));
            Ok(())
        }
        LibreImage::Batch(batch) => {
            if let Some(age) = batch.sensor_age_minutes {
                core.event(SessionEvent::SensorAge(age));
            }
            core.push(SessionAction::Deliver(batch));
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-built Libre images for session and coordinator tests.

    use cgm_types::crc::{CrcLayout, repair_image};

    pub const STATE_OFFSET: usize = 4;
    pub const TREND_CURSOR: usize = 26;
    pub const HISTORY_CURSOR: usize = 27;
    pub const AGE_OFFSET: usize = 316;

    /// A valid 344-byte image with the given state, age and trend cursor.
    pub fn image(state: u8, age_minutes: u16, trend_cursor: u8) -> Vec<u8> {
        let mut image = vec![0u8; 344];
        image[STATE_OFFSET] = state;
        image[TREND_CURSOR] = trend_cursor;
        image[HISTORY_CURSOR] = 0;
        image[AGE_OFFSET..AGE_OFFSET + 2].copy_from_slice(&age_minutes.to_le_bytes());
        repair_image(&mut image, 0, CrcLayout::Libre1);
        image
    }

    /// Write a raw trend value `k` slots before the cursor (0 = newest).
    pub fn set_trend_age(image: &mut [u8], k: usize, raw: u16) {
        let cursor = usize::from(image[TREND_CURSOR]);
        let slot = (cursor + 16 - 1 - k) % 16;
        let start = 28 + slot * 6;
        image[start..start + 2].copy_from_slice(&raw.to_le_bytes());
        repair_image(image, 0, CrcLayout::Libre1);
    }

    /// An image with all sixteen trend slots filled, newest first.
    pub fn full_trend(age_minutes: u16, raws: &[u16; 16]) -> Vec<u8> {
        let mut img = image(0x03, age_minutes, 5);
        for (k, raw) in raws.iter().enumerate() {
            set_trend_age(&mut img, k, *raw);
        }
        img
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    fn decoding() -> LibreDecoding {
        LibreDecoding {
            min_spacing: time::Duration::seconds(50),
            tolerance: time::Duration::seconds(30),
            max_sensor_age_minutes: 14 * 1440,
        }
    }

    #[test]
    fn test_core_tracks_timers() {
        let mut core = SessionCore::default();
        core.set_timer(now(), TimerKind::AckWindow, Duration::from_secs(5));
        core.set_timer(now(), TimerKind::FragmentWindow, Duration::from_secs(2));
        assert_eq!(
            core.next_timeout(),
            Some((TimerKind::FragmentWindow, now() + time::Duration::seconds(2)))
        );
        core.cancel_timer(TimerKind::FragmentWindow);
        core.cancel_timer(TimerKind::FragmentWindow);
        assert!(core.fired(TimerKind::AckWindow));
        assert!(core.next_timeout().is_none());

        let actions: Vec<_> = std::iter::from_fn(|| core.poll()).collect();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[2], SessionAction::CancelTimer(TimerKind::FragmentWindow));
    }

    #[test]
    fn test_decode_valid_image() {
        let img = full_trend(2000, &[850; 16]);
        match decode_libre_image(&img, 0, "S1", now(), None, &decoding()) {
            LibreImage::Batch(batch) => {
                assert_eq!(batch.samples.len(), 16);
                assert_eq!(batch.sensor_age_minutes, Some(2000));
                assert_eq!(batch.samples[0].timestamp, now());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_image_yields_nothing() {
        let mut img = full_trend(2000, &[850; 16]);
        img[40] ^= 0x01;
        assert!(matches!(
            decode_libre_image(&img, 0, "S1", now(), None, &decoding()),
            LibreImage::Corrupt(ProtocolError::CrcMismatch { region: "body" })
        ));
    }

    #[test]
    fn test_not_ready_sensor() {
        let img = image(0x02, 30, 0);
        let mut core = SessionCore::default();
        let outcome = decode_libre_image(&img, 0, "S1", now(), None, &decoding());
        assert!(emit_libre_image(&mut core, outcome).is_ok());
        let actions: Vec<_> = std::iter::from_fn(|| core.poll()).collect();
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Event(SessionEvent::Sensor(SensorError::SensorNotReady(_)))
        )));
        assert!(!actions.iter().any(|a| matches!(a, SessionAction::Deliver(_))));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn single_bit_flip_never_delivers(byte in 0usize..344, bit in 0u8..8) {
                let mut img = full_trend(2000, &[850; 16]);
                img[byte] ^= 1 << bit;
                let mut core = SessionCore::default();
                let outcome = decode_libre_image(&img, 0, "S1", now(), None, &decoding());
                prop_assert!(emit_libre_image(&mut core, outcome).is_err());
                let delivered = std::iter::from_fn(|| core.poll())
                    .any(|a| matches!(a, SessionAction::Deliver(_)));
                prop_assert!(!delivered);
            }
        }
    }
}
