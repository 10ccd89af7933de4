//! MiaoMiao NFC bridge.
//!
//! The bridge keeps the link open and pushes a full sensor memory packet
//! every few minutes, split over many notifications. A packet starts with
//! `0x28`; continuation fragments carry no marker, so the session buffers
//! them in a [`SensorMemorySnapshot`] until [`PACKET_LEN`] have arrived.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::miaomiao::{
    ALLOW_NEW_SENSOR, HEADER_LEN, MiaoMiaoPacket, MiaoMiaoResponse, PACKET_LEN, START_READING,
};
use cgm_types::uuids::{MIAOMIAO_RECEIVE, MIAOMIAO_SERVICE, MIAOMIAO_WRITE};
use cgm_types::{
    ProtocolError, SensorError, SensorMemorySnapshot, SnapshotStatus, TransmitterKind,
};

use super::{
    DeviceSession, LibreDecoding, LibreImage, LinkPolicy, SessionAction, SessionCore,
    SessionEvent, decode_libre_image, emit_libre_image,
};
use crate::config::TransmitterConfig;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

/// A partial packet older than this is discarded.
pub const PACKET_WINDOW: Duration = Duration::from_secs(59);

/// Pause between the commands that confirm a new sensor.
pub const NEW_SENSOR_DELAY: Duration = Duration::from_millis(500);

/// Command queued behind [`TimerKind::DelayedCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delayed {
    AllowNewSensor,
    StartReading,
}

/// Session state machine for the MiaoMiao bridge.
#[derive(Debug)]
pub struct MiaoMiaoSession {
    core: SessionCore,
    decoding: LibreDecoding,
    transmitter_id: String,
    max_resends: u32,
    last_accepted: Option<OffsetDateTime>,

    snapshot: SensorMemorySnapshot,
    resends: u32,
    delayed: Option<Delayed>,
}

impl MiaoMiaoSession {
    /// A session configured from `config`.
    pub fn new(config: &TransmitterConfig) -> Self {
        Self {
            core: SessionCore::default(),
            decoding: LibreDecoding::from_config(config),
            transmitter_id: config.transmitter_id.clone(),
            max_resends: config.max_resends,
            last_accepted: None,
            snapshot: SensorMemorySnapshot::new(PACKET_LEN),
            resends: 0,
            delayed: None,
        }
    }

    fn start_reading(&mut self) {
        self.core.write(MIAOMIAO_WRITE, [START_READING], true);
    }

    fn discard_buffer(&mut self) {
        self.snapshot.reset();
        self.core.cancel_timer(TimerKind::PacketWindow);
    }

    /// Ask for the packet again after a bad transfer, or end the cycle.
    fn retry_packet(&mut self) {
        self.discard_buffer();
        if self.resends < self.max_resends {
            self.resends += 1;
            warn!(attempt = self.resends, "requesting packet again");
            self.start_reading();
        } else {
            warn!(resends = self.resends, "giving up on this packet");
            self.resends = 0;
            self.core.push(SessionAction::CycleComplete);
        }
    }

    fn on_first_fragment(&mut self, now: OffsetDateTime, bytes: &[u8]) {
        match MiaoMiaoResponse::decode(bytes[0]) {
            MiaoMiaoResponse::DataPacket => {
                self.core.set_timer(now, TimerKind::PacketWindow, PACKET_WINDOW);
                self.append(now, bytes);
            }
            MiaoMiaoResponse::NewSensor => {
                info!("bridge detected a new sensor");
                self.core.event(SessionEvent::NewSensorDetected);
                self.delayed = Some(Delayed::AllowNewSensor);
                self.core.set_timer(now, TimerKind::DelayedCommand, NEW_SENSOR_DELAY);
            }
            MiaoMiaoResponse::NoSensor => {
                warn!("bridge reports no sensor");
                self.core.event(SessionEvent::Sensor(SensorError::SensorNotDetected));
                self.core.push(SessionAction::CycleComplete);
            }
            MiaoMiaoResponse::FrequencyChanged => debug!("reading interval changed"),
            other => debug!(response = ?other, "dropped miaomiao frame"),
        }
    }

    fn append(&mut self, now: OffsetDateTime, fragment: &[u8]) {
        match self.snapshot.append_fragment(fragment, now) {
            SnapshotStatus::Incomplete => {}
            SnapshotStatus::Complete(packet) => {
                self.core.cancel_timer(TimerKind::PacketWindow);
                self.on_packet(now, &packet);
            }
            SnapshotStatus::Overflow { received } => {
                warn!(received, expected = PACKET_LEN, "miaomiao packet overflow");
                self.core.event(SessionEvent::Protocol(ProtocolError::SnapshotOverflow {
                    received,
                    expected: PACKET_LEN,
                }));
                self.retry_packet();
            }
        }
    }

    fn on_packet(&mut self, now: OffsetDateTime, packet_bytes: &[u8]) {
        let packet = match MiaoMiaoPacket::parse(packet_bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "unusable miaomiao packet");
                self.core.event(SessionEvent::Protocol(e));
                return;
            }
        };
        let sensor_id = packet.serial().unwrap_or_else(|| self.transmitter_id.clone());
        let decoded = decode_libre_image(
            packet_bytes,
            HEADER_LEN,
            &sensor_id,
            now,
            self.last_accepted,
            &self.decoding,
        );

        let decoded = match decoded {
            LibreImage::Corrupt(e) => {
                // header fields are not trusted either
                self.core.event(SessionEvent::Protocol(e));
                self.retry_packet();
                return;
            }
            other => other,
        };

        self.resends = 0;
        debug!(
            battery = packet.battery_percent,
            firmware = %packet.firmware,
            hardware = %packet.hardware,
            "miaomiao packet"
        );
        if let Some(serial) = packet.serial() {
            self.core.event(SessionEvent::SensorSerial(serial));
        }
        self.core.event(SessionEvent::BatteryLevel(packet.battery_percent));
        self.core.event(SessionEvent::Firmware {
            firmware: packet.firmware,
            hardware: packet.hardware,
        });
        if let Err(e) = emit_libre_image(&mut self.core, decoded) {
            debug!(error = %e, "sensor image not delivered");
        }
        self.core.push(SessionAction::CycleComplete);
    }
}

impl DeviceSession for MiaoMiaoSession {
    fn kind(&self) -> TransmitterKind {
        TransmitterKind::MiaoMiao
    }

    fn link_profile(&self) -> LinkProfile {
        LinkProfile {
            service: MIAOMIAO_SERVICE,
            advertised_service: Some(MIAOMIAO_SERVICE),
            name_pattern: Some(if self.transmitter_id.is_empty() {
                "miaomiao".to_string()
            } else {
                self.transmitter_id.clone()
            }),
            notify: vec![MIAOMIAO_RECEIVE],
            write: MIAOMIAO_WRITE,
            authenticates: false,
        }
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::StayConnected
    }

    fn set_last_accepted(&mut self, last: Option<OffsetDateTime>) {
        self.last_accepted = last;
    }

    fn handle_connected(&mut self, _now: OffsetDateTime) {
        self.start_reading();
    }

    fn handle_value(&mut self, now: OffsetDateTime, characteristic: Uuid, bytes: &[u8]) {
        if characteristic != MIAOMIAO_RECEIVE || bytes.is_empty() {
            return;
        }
        if self.snapshot.is_empty() {
            self.on_first_fragment(now, bytes);
        } else {
            self.append(now, bytes);
        }
    }

    fn handle_timeout(&mut self, now: OffsetDateTime, timer: TimerKind) {
        if !self.core.fired(timer) {
            return;
        }
        match timer {
            TimerKind::PacketWindow => {
                warn!(received = self.snapshot.len(), "stale partial packet discarded");
                self.discard_buffer();
            }
            TimerKind::DelayedCommand => match self.delayed.take() {
                Some(Delayed::AllowNewSensor) => {
                    self.core.write(MIAOMIAO_WRITE, ALLOW_NEW_SENSOR, true);
                    self.delayed = Some(Delayed::StartReading);
                    self.core.set_timer(now, TimerKind::DelayedCommand, NEW_SENSOR_DELAY);
                }
                Some(Delayed::StartReading) => self.start_reading(),
                None => {}
            },
            _ => {}
        }
    }

    fn handle_disconnected(&mut self, _now: OffsetDateTime) {
        self.reset();
    }

    fn poll_action(&mut self) -> Option<SessionAction> {
        self.core.poll()
    }

    fn poll_timeout(&self) -> Option<(TimerKind, OffsetDateTime)> {
        self.core.next_timeout()
    }

    fn reset(&mut self) {
        self.core.clear();
        self.snapshot.reset();
        self.resends = 0;
        self.delayed = None;
    }
}
