//! Bubble and Atom NFC bridges.
//!
//! Each reading starts with a transmitter info message that the session
//! acknowledges. The bridge then sends the sensor UID (and, on the Atom,
//! the patch info) followed by the sensor image in data packets of sixteen
//! image bytes each. The image is assembled in a [`SensorMemorySnapshot`];
//! the final packet may carry padding past the image end, which is cut.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::bubble::{
    self, BridgeModel, BubbleResponse, IMAGE_LEN, TransmitterInfo, family_from_patch_info,
    packet_payload,
};
use cgm_types::serial::libre_serial_number;
use cgm_types::uuids::{BUBBLE_RECEIVE, BUBBLE_SERVICE, BUBBLE_WRITE};
use cgm_types::{
    LibreFamily, ProtocolError, SensorError, SensorMemorySnapshot, SnapshotStatus, TransmitterKind,
};

use super::{
    DeviceSession, LibreDecoding, LibreImage, LinkPolicy, SessionAction, SessionCore,
    SessionEvent, decode_libre_image, emit_libre_image,
};
use crate::config::TransmitterConfig;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

/// A Bubble image not complete this long after its first packet is dropped.
pub const BUBBLE_PACKET_WINDOW: Duration = Duration::from_secs(59);

/// An Atom image is dropped when packets stop for this long.
pub const ATOM_PACKET_GAP: Duration = Duration::from_secs(3);

/// Session state machine for the Bubble and Atom bridges.
#[derive(Debug)]
pub struct BubbleSession {
    core: SessionCore,
    model: BridgeModel,
    decoding: LibreDecoding,
    transmitter_id: String,
    max_resends: u32,
    last_accepted: Option<OffsetDateTime>,

    snapshot: SensorMemorySnapshot,
    uid: Option<[u8; 8]>,
    family: Option<LibreFamily>,
    firmware_version: Option<(u8, u8)>,
    resends: u32,
}

impl BubbleSession {
    /// A session configured from `config`; the bridge model follows its kind.
    pub fn new(config: &TransmitterConfig) -> Self {
        let model = if config.kind == TransmitterKind::Atom {
            BridgeModel::Atom
        } else {
            BridgeModel::Bubble
        };
        Self {
            core: SessionCore::default(),
            model,
            decoding: LibreDecoding::from_config(config),
            transmitter_id: config.transmitter_id.clone(),
            max_resends: config.max_resends,
            last_accepted: None,
            snapshot: SensorMemorySnapshot::new(IMAGE_LEN),
            uid: None,
            family: None,
            firmware_version: None,
            resends: 0,
        }
    }

    fn start_reading(&mut self) {
        self.core.write(BUBBLE_WRITE, self.model.start_reading(), false);
    }

    fn discard_image(&mut self) {
        self.snapshot.reset();
        self.core.cancel_timer(TimerKind::PacketWindow);
    }

    fn retry_image(&mut self) {
        self.discard_image();
        if self.resends < self.max_resends {
            self.resends += 1;
            warn!(attempt = self.resends, "requesting sensor image again");
            self.start_reading();
        } else {
            warn!(resends = self.resends, "giving up on this sensor image");
            self.resends = 0;
            self.core.push(SessionAction::CycleComplete);
        }
    }

    fn on_info(&mut self, bytes: &[u8]) {
        let info = match TransmitterInfo::parse(bytes, self.model) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "unusable bridge info");
                self.core.event(SessionEvent::Protocol(e));
                return;
            }
        };
        debug!(
            battery = info.battery_percent,
            firmware = %info.firmware,
            hardware = %info.hardware,
            "bridge info"
        );
        self.discard_image();
        self.firmware_version = Some(info.firmware_version);
        self.core.event(SessionEvent::BatteryLevel(info.battery_percent));
        self.core.event(SessionEvent::Firmware {
            firmware: info.firmware,
            hardware: info.hardware,
        });
        self.core.write(BUBBLE_WRITE, self.model.info_ack(), false);
    }

    fn on_uid(&mut self, bytes: &[u8]) {
        match bubble::sensor_uid(bytes) {
            Ok(uid) => self.uid = Some(uid),
            Err(e) => {
                warn!(error = %e, "unusable sensor uid");
                self.core.event(SessionEvent::Protocol(e));
            }
        }
    }

    fn on_patch_info(&mut self, bytes: &[u8]) {
        let Some(firmware) = self.firmware_version else {
            debug!("patch info before bridge info, ignored");
            return;
        };
        match bubble::patch_info(bytes, firmware) {
            Ok(patch) => {
                self.family = family_from_patch_info(&patch);
                debug!(patch = ?patch, family = ?self.family, "patch info");
            }
            Err(e) => {
                warn!(error = %e, "unusable patch info");
                self.core.event(SessionEvent::Protocol(e));
            }
        }
    }

    fn on_packet(&mut self, now: OffsetDateTime, bytes: &[u8]) {
        match self.model {
            BridgeModel::Bubble if self.snapshot.is_empty() => {
                self.core.set_timer(now, TimerKind::PacketWindow, BUBBLE_PACKET_WINDOW);
            }
            BridgeModel::Bubble => {}
            BridgeModel::Atom => self.core.set_timer(now, TimerKind::PacketWindow, ATOM_PACKET_GAP),
        }
        let payload = packet_payload(bytes);
        let room = IMAGE_LEN - self.snapshot.len();
        match self.snapshot.append_fragment(&payload[..payload.len().min(room)], now) {
            SnapshotStatus::Incomplete => {}
            SnapshotStatus::Complete(image) => {
                self.core.cancel_timer(TimerKind::PacketWindow);
                self.on_image(now, &image);
            }
            SnapshotStatus::Overflow { received } => {
                warn!(received, expected = IMAGE_LEN, "sensor image overflow");
                self.core.event(SessionEvent::Protocol(ProtocolError::SnapshotOverflow {
                    received,
                    expected: IMAGE_LEN,
                }));
                self.retry_image();
            }
        }
    }

    fn on_image(&mut self, now: OffsetDateTime, image: &[u8]) {
        let family = self.family.unwrap_or(LibreFamily::Libre1);
        if family != LibreFamily::Libre1 {
            warn!(?family, "sensor image format not supported");
            self.core.event(SessionEvent::Sensor(SensorError::SensorNotReady(format!(
                "{family:?} sensors are not supported"
            ))));
            self.core.push(SessionAction::CycleComplete);
            return;
        }
        let serial = self.uid.map(|uid| libre_serial_number(&uid, family));
        let sensor_id = serial.clone().unwrap_or_else(|| self.transmitter_id.clone());
        let decoded = decode_libre_image(image, 0, &sensor_id, now, self.last_accepted, &self.decoding);
        if let LibreImage::Corrupt(e) = decoded {
            self.core.event(SessionEvent::Protocol(e));
            self.retry_image();
            return;
        }

        self.resends = 0;
        if let Some(serial) = serial {
            self.core.event(SessionEvent::SensorSerial(serial));
        }
        if let Err(e) = emit_libre_image(&mut self.core, decoded) {
            debug!(error = %e, "sensor image not delivered");
        }
        self.core.push(SessionAction::CycleComplete);
    }
}

impl DeviceSession for BubbleSession {
    fn kind(&self) -> TransmitterKind {
        match self.model {
            BridgeModel::Bubble => TransmitterKind::Bubble,
            BridgeModel::Atom => TransmitterKind::Atom,
        }
    }

    fn link_profile(&self) -> LinkProfile {
        let default_name = match self.model {
            BridgeModel::Bubble => "Bubble",
            BridgeModel::Atom => "Atom",
        };
        LinkProfile {
            service: BUBBLE_SERVICE,
            advertised_service: None,
            name_pattern: Some(if self.transmitter_id.is_empty() {
                default_name.to_string()
            } else {
                self.transmitter_id.clone()
            }),
            notify: vec![BUBBLE_RECEIVE],
            write: BUBBLE_WRITE,
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
        if characteristic != BUBBLE_RECEIVE {
            return;
        }
        let Some(&first) = bytes.first() else {
            return;
        };
        match BubbleResponse::decode(first) {
            BubbleResponse::TransmitterInfo => self.on_info(bytes),
            BubbleResponse::SensorUid => self.on_uid(bytes),
            BubbleResponse::PatchInfo => self.on_patch_info(bytes),
            BubbleResponse::DataPacket => self.on_packet(now, bytes),
            BubbleResponse::NoSensor => {
                warn!("bridge reports no sensor");
                self.discard_image();
                self.core.event(SessionEvent::Sensor(SensorError::SensorNotDetected));
                self.core.push(SessionAction::CycleComplete);
            }
            other => {
                debug!(response = ?other, "dropped bridge frame, image discarded");
                self.discard_image();
            }
        }
    }

    fn handle_timeout(&mut self, _now: OffsetDateTime, timer: TimerKind) {
        if self.core.fired(timer) && timer == TimerKind::PacketWindow {
            info!(received = self.snapshot.len(), "incomplete sensor image discarded");
            self.snapshot.reset();
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::full_trend;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    fn bubble() -> BubbleSession {
        BubbleSession::new(&TransmitterConfig::bubble().with_sample_spacing_secs(50))
    }

    fn atom() -> BubbleSession {
        BubbleSession::new(&TransmitterConfig::atom().with_sample_spacing_secs(50))
    }

    fn drain(s: &mut BubbleSession) -> Vec<SessionAction> {
        std::iter::from_fn(|| s.poll_action()).collect()
    }

    const INFO: [u8; 8] = [0x80, 0x00, 0x01, 0x40, 64, 0x00, 0x01, 0x00];
    const UID: [u8; 10] = [0xC0, 0x00, 0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0];

    /// Split an image into data packets of sixteen bytes, the last padded.
    fn packets(image: &[u8]) -> Vec<Vec<u8>> {
        image
            .chunks(16)
            .map(|chunk| {
                let mut p = vec![0x82, 0x00, 0x00, 0x00];
                p.extend_from_slice(chunk);
                p.resize(20, 0x00);
                p
            })
            .collect()
    }

    fn feed_reading(s: &mut BubbleSession, image: &[u8]) -> Vec<SessionAction> {
        s.handle_value(now(), BUBBLE_RECEIVE, &INFO);
        s.handle_value(now(), BUBBLE_RECEIVE, &UID);
        for p in packets(image) {
            s.handle_value(now(), BUBBLE_RECEIVE, &p);
        }
        drain(s)
    }

    fn batches(actions: &[SessionAction]) -> usize {
        actions.iter().filter(|a| matches!(a, SessionAction::Deliver(_))).count()
    }

    #[test]
    fn test_connect_starts_reading() {
        let mut s = atom();
        s.handle_connected(now());
        assert_eq!(
            drain(&mut s),
            vec![SessionAction::Write {
                characteristic: BUBBLE_WRITE,
                bytes: vec![0x00, 0x01, 0x05],
                require_ack: false,
            }]
        );
    }

    #[test]
    fn test_info_is_acknowledged() {
        let mut s = bubble();
        s.handle_value(now(), BUBBLE_RECEIVE, &INFO);
        let actions = drain(&mut s);
        assert!(actions.contains(&SessionAction::Event(SessionEvent::BatteryLevel(64))));
        assert!(actions.contains(&SessionAction::Event(SessionEvent::Firmware {
            firmware: "1.64".into(),
            hardware: "1.0".into(),
        })));
        assert_eq!(
            actions.last(),
            Some(&SessionAction::Write {
                characteristic: BUBBLE_WRITE,
                bytes: BridgeModel::Bubble.info_ack().to_vec(),
                require_ack: false,
            })
        );
    }

    #[test]
    fn test_padded_packets_deliver_one_batch() {
        let mut s = bubble();
        let actions = feed_reading(&mut s, &full_trend(3000, &[850; 16]));
        assert_eq!(batches(&actions), 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Event(SessionEvent::SensorSerial(serial)) if serial.starts_with('0')
        )));
        assert_eq!(actions.last(), Some(&SessionAction::CycleComplete));
        assert!(s.snapshot.is_empty());
        assert!(s.poll_timeout().is_none());
    }

    #[test]
    fn test_crc_failure_requests_again() {
        let mut s = atom();
        let mut image = full_trend(3000, &[850; 16]);
        image[40] ^= 0x04;
        let actions = feed_reading(&mut s, &image);
        assert_eq!(batches(&actions), 0);
        assert!(actions.contains(&SessionAction::Event(SessionEvent::Protocol(
            ProtocolError::CrcMismatch { region: "body" }
        ))));
        assert!(actions.contains(&SessionAction::Write {
            characteristic: BUBBLE_WRITE,
            bytes: BridgeModel::Atom.start_reading().to_vec(),
            require_ack: false,
        }));
        assert_eq!(s.resends, 1);
    }

    #[test]
    fn test_libre2_patch_info_is_not_decoded() {
        let mut s = atom();
        s.handle_value(now(), BUBBLE_RECEIVE, &INFO);
        s.handle_value(now(), BUBBLE_RECEIVE, &[0xC1, 0, 0, 0, 0, 0x9D, 0x08, 0x30, 0x01, 0, 0]);
        drain(&mut s);
        let actions = feed_reading(&mut s, &full_trend(3000, &[850; 16]));
        assert_eq!(batches(&actions), 0);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Event(SessionEvent::Sensor(SensorError::SensorNotReady(_)))
        )));
    }

    #[test]
    fn test_atom_gap_discards_partial_image() {
        let mut s = atom();
        let image = full_trend(3000, &[850; 16]);
        let first = &packets(&image)[0];
        s.handle_value(now(), BUBBLE_RECEIVE, first);
        assert_eq!(
            s.poll_timeout(),
            Some((TimerKind::PacketWindow, now() + time::Duration::seconds(3)))
        );
        s.handle_timeout(now() + time::Duration::seconds(3), TimerKind::PacketWindow);
        assert!(s.snapshot.is_empty());
    }

    #[test]
    fn test_no_sensor() {
        let mut s = bubble();
        s.handle_value(now(), BUBBLE_RECEIVE, &[0xBF]);
        assert_eq!(
            drain(&mut s),
            vec![
                SessionAction::Event(SessionEvent::Sensor(SensorError::SensorNotDetected)),
                SessionAction::CycleComplete,
            ]
        );
    }

    #[test]
    fn test_kind_follows_config() {
        assert_eq!(bubble().kind(), TransmitterKind::Bubble);
        assert_eq!(atom().kind(), TransmitterKind::Atom);
        assert_eq!(atom().link_profile().name_pattern.as_deref(), Some("Atom"));
    }
}
