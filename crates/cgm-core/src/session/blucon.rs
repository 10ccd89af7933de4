//! Blucon NFC bridge.
//!
//! The Blucon wakes up every five minutes, connects, and walks through a
//! fixed command exchange before it will read the sensor:
//!
//! ```text
//! <- wakeUpRequest        -> getPatchInfo
//! <- patchInfo            -> wakeUpResponse
//! <- ack                  -> unknown1
//! <- unknown1Response     -> unknown2
//! <- unknown2Response     -> getHistoricData | getNowDataIndex
//! <- multiBlock...        (historic: 44 blocks, then sleep)
//! <- singleBlock (index)  -> singleBlock request for the newest trend slot
//! <- singleBlock (value)  -> sleep
//! ```
//!
//! After `sleep` the bridge drops the link on its own, so the coordinator
//! disconnects once the cycle completes.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::blucon::{self, BluconOpcode, HISTORIC_IMAGE_LEN, PatchInfo};
use cgm_types::frame::{BatteryStatus, DecodedFrame, DeviceFault};
use cgm_types::libre::raw_to_mg_dl;
use cgm_types::uuids::{BLUCON_RECEIVE, BLUCON_SERVICE, BLUCON_WRITE};
use cgm_types::{
    GlucoseSample, SensorError, SensorMemorySnapshot, SensorState, SnapshotStatus, TransmitterKind,
    decode_opcode,
};

use super::{
    Batch, DeviceSession, LibreDecoding, LinkPolicy, SessionAction, SessionCore, SessionEvent,
    decode_libre_image, emit_libre_image,
};
use crate::config::TransmitterConfig;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

/// Battery level assumed when the bridge wakes without a low-battery message.
const WAKE_BATTERY_PERCENT: u8 = 100;

/// Pending second half of the now-block exchange.
#[derive(Debug, Clone, Copy)]
struct NowBlockRequest {
    sent_at: OffsetDateTime,
    offset: usize,
}

/// Session state machine for the Blucon bridge.
#[derive(Debug)]
pub struct BluconSession {
    core: SessionCore,
    decoding: LibreDecoding,
    transmitter_id: String,
    fragment_window: Duration,
    max_resends: u32,
    last_accepted: Option<OffsetDateTime>,

    serial: Option<String>,
    wake_response_at: Option<OffsetDateTime>,
    snapshot: SensorMemorySnapshot,
    resends: u32,
    now_block: Option<NowBlockRequest>,
    asleep: bool,
}

impl BluconSession {
    /// A session configured from `config`.
    pub fn new(config: &TransmitterConfig) -> Self {
        Self {
            core: SessionCore::default(),
            decoding: LibreDecoding::from_config(config),
            transmitter_id: config.transmitter_id.clone(),
            fragment_window: config.fragment_window(),
            max_resends: config.max_resends,
            last_accepted: None,
            serial: None,
            wake_response_at: None,
            snapshot: SensorMemorySnapshot::new(HISTORIC_IMAGE_LEN),
            resends: 0,
            now_block: None,
            asleep: false,
        }
    }

    fn send(&mut self, opcode: BluconOpcode) {
        debug!(?opcode, "blucon command");
        self.core.write(BLUCON_WRITE, opcode.bytes(), true);
    }

    fn sensor_id(&self) -> String {
        self.serial.clone().unwrap_or_else(|| self.transmitter_id.clone())
    }

    /// Put the bridge to sleep; nothing more happens until the next wake-up.
    fn sleep(&mut self) {
        if self.asleep {
            return;
        }
        self.asleep = true;
        self.snapshot.reset();
        self.now_block = None;
        self.wake_response_at = None;
        self.core.cancel_timer(TimerKind::FragmentWindow);
        self.core.cancel_timer(TimerKind::NowBlockWindow);
        self.core.cancel_timer(TimerKind::AckWindow);
        self.send(BluconOpcode::Sleep);
        self.core.push(SessionAction::CycleComplete);
    }

    fn on_wake_up(&mut self) {
        // a new exchange starts, even mid-way through a previous one
        self.asleep = false;
        self.wake_response_at = None;
        self.now_block = None;
        self.snapshot.reset();
        self.resends = 0;
        self.send(BluconOpcode::GetPatchInfoRequest);
        self.core.event(SessionEvent::BatteryLevel(WAKE_BATTERY_PERCENT));
    }

    fn on_patch_info(&mut self, now: OffsetDateTime, info: PatchInfo) {
        info!(serial = %info.serial, state = %info.state, "blucon patch info");
        self.serial = Some(info.serial.clone());
        self.core.event(SessionEvent::SensorSerial(info.serial));
        if info.state == SensorState::Ready {
            self.wake_response_at = Some(now);
            self.send(BluconOpcode::WakeUpResponse);
            self.core.set_timer(now, TimerKind::AckWindow, ack_window());
        } else {
            self.core.event(SessionEvent::Sensor(SensorError::SensorNotReady(
                info.state.to_string(),
            )));
            self.sleep();
        }
    }

    fn on_ack(&mut self, now: OffsetDateTime) {
        let Some(sent) = self.wake_response_at else {
            debug!("ack without pending wake-up response ignored");
            return;
        };
        if now - sent > blucon::ACK_WINDOW {
            debug!("late ack ignored");
            return;
        }
        self.wake_response_at = None;
        self.core.cancel_timer(TimerKind::AckWindow);
        self.send(BluconOpcode::Unknown1Command);
    }

    fn on_unknown2_response(&mut self, now: OffsetDateTime, payload: &[u8]) {
        if let Some(percent) = blucon::battery_indication(payload) {
            self.core.event(SessionEvent::BatteryLevel(percent));
        }
        if blucon::needs_historic(self.last_accepted, now) {
            self.request_historic();
        } else {
            self.send(BluconOpcode::GetNowDataIndex);
        }
    }

    fn request_historic(&mut self) {
        self.snapshot.reset();
        self.send(BluconOpcode::GetHistoricData);
    }

    /// Resend the historic request after a failed transfer, or give up.
    fn retry_historic(&mut self) {
        self.snapshot.reset();
        self.core.cancel_timer(TimerKind::FragmentWindow);
        if self.resends < self.max_resends {
            self.resends += 1;
            warn!(attempt = self.resends, "resending historic data request");
            self.request_historic();
        } else {
            warn!(resends = self.resends, "historic transfer failed, giving up");
            self.sleep();
        }
    }

    fn on_multi_block(&mut self, now: OffsetDateTime, payload: &[u8]) {
        let Some(fragment) = blucon::multi_block_payload(payload) else {
            return;
        };
        if self.snapshot.is_empty() {
            self.core.set_timer(now, TimerKind::FragmentWindow, self.fragment_window);
        }
        match self.snapshot.append_fragment(fragment, now) {
            SnapshotStatus::Incomplete => {}
            SnapshotStatus::Complete(assembled) => {
                self.core.cancel_timer(TimerKind::FragmentWindow);
                let Some(image) = blucon::historic_image(&assembled) else {
                    self.retry_historic();
                    return;
                };
                let sensor_id = self.sensor_id();
                let decoded = decode_libre_image(
                    image,
                    0,
                    &sensor_id,
                    now,
                    self.last_accepted,
                    &self.decoding,
                );
                if emit_libre_image(&mut self.core, decoded).is_ok() {
                    self.resends = 0;
                    self.sleep();
                } else {
                    self.retry_historic();
                }
            }
            SnapshotStatus::Overflow { received } => {
                warn!(received, expected = HISTORIC_IMAGE_LEN, "historic transfer overflow");
                self.core.event(SessionEvent::Protocol(
                    cgm_types::ProtocolError::SnapshotOverflow {
                        received,
                        expected: HISTORIC_IMAGE_LEN,
                    },
                ));
                self.retry_historic();
            }
        }
    }

    fn on_single_block(&mut self, now: OffsetDateTime, payload: &[u8]) {
        match self.now_block.take() {
            None => match blucon::now_block_request(payload) {
                Some((request, offset)) => {
                    debug!(offset, "requesting newest trend block");
                    self.core.write(BLUCON_WRITE, request, true);
                    self.now_block = Some(NowBlockRequest { sent_at: now, offset });
                    self.core
                        .set_timer(now, TimerKind::NowBlockWindow, now_block_window());
                }
                None => {
                    warn!("malformed now-data index");
                    self.sleep();
                }
            },
            Some(pending) => {
                self.core.cancel_timer(TimerKind::NowBlockWindow);
                if now - pending.sent_at > blucon::NOW_BLOCK_WINDOW {
                    debug!("stale now-block answer");
                    self.sleep();
                    return;
                }
                if let Some(raw) = blucon::now_glucose_raw(payload, pending.offset) {
                    let sample = GlucoseSample::new(now, raw_to_mg_dl(raw));
                    self.core.push(SessionAction::Deliver(Batch {
                        sensor_id: self.sensor_id(),
                        samples: vec![sample],
                        sensor_age_minutes: None,
                        max_sensor_age_minutes: Some(self.decoding.max_sensor_age_minutes),
                    }));
                }
                self.sleep();
            }
        }
    }
}

fn ack_window() -> Duration {
    Duration::try_from(blucon::ACK_WINDOW).unwrap_or(Duration::from_secs(5))
}

fn now_block_window() -> Duration {
    Duration::try_from(blucon::NOW_BLOCK_WINDOW).unwrap_or(Duration::from_secs(2))
}

impl DeviceSession for BluconSession {
    fn kind(&self) -> TransmitterKind {
        TransmitterKind::Blucon
    }

    fn link_profile(&self) -> LinkProfile {
        LinkProfile {
            service: BLUCON_SERVICE,
            advertised_service: None,
            name_pattern: Some(if self.transmitter_id.is_empty() {
                "blu".to_string()
            } else {
                self.transmitter_id.clone()
            }),
            notify: vec![BLUCON_RECEIVE],
            write: BLUCON_WRITE,
            authenticates: false,
        }
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::DisconnectAfterCycle
    }

    fn set_last_accepted(&mut self, last: Option<OffsetDateTime>) {
        self.last_accepted = last;
    }

    fn handle_connected(&mut self, _now: OffsetDateTime) {
        // the bridge speaks first
        self.asleep = false;
    }

    fn handle_value(&mut self, now: OffsetDateTime, characteristic: Uuid, bytes: &[u8]) {
        if characteristic != BLUCON_RECEIVE {
            debug!(%characteristic, "value on unexpected characteristic");
            return;
        }
        let frame = decode_opcode(TransmitterKind::Blucon, bytes);
        if self.asleep && !matches!(frame, DecodedFrame::Blucon { opcode: BluconOpcode::WakeUpRequest, .. }) {
            debug!("frame after sleep ignored");
            return;
        }
        match frame {
            DecodedFrame::PatchInfo(info) => self.on_patch_info(now, info),
            DecodedFrame::BatteryStatus(BatteryStatus::Percent(percent)) => {
                self.core.event(SessionEvent::BatteryLevel(percent));
            }
            DecodedFrame::Error(DeviceFault::CommandTimeout) => {
                warn!("blucon reported error 14");
                self.sleep();
            }
            DecodedFrame::Error(DeviceFault::SensorNotDetected) => {
                warn!("blucon reports no sensor");
                self.core.event(SessionEvent::Sensor(SensorError::SensorNotDetected));
                self.sleep();
            }
            DecodedFrame::Error(DeviceFault::Malformed(e)) => {
                warn!(error = %e, "malformed blucon frame");
                self.core.event(SessionEvent::Protocol(e));
                self.sleep();
            }
            DecodedFrame::Blucon { opcode, payload } => match opcode {
                BluconOpcode::WakeUpRequest => self.on_wake_up(),
                BluconOpcode::AckResponse => self.on_ack(now),
                BluconOpcode::Unknown1Response => self.send(BluconOpcode::Unknown2Command),
                BluconOpcode::Unknown2Response => self.on_unknown2_response(now, &payload),
                BluconOpcode::MultipleBlockResponse => self.on_multi_block(now, &payload),
                BluconOpcode::SingleBlockResponse => self.on_single_block(now, &payload),
                other => debug!(opcode = ?other, "unhandled blucon opcode"),
            },
            other => debug!(frame = ?other, "dropped blucon frame"),
        }
    }

    fn handle_timeout(&mut self, _now: OffsetDateTime, timer: TimerKind) {
        if !self.core.fired(timer) {
            return;
        }
        match timer {
            TimerKind::AckWindow => {
                debug!("no ack to wake-up response");
                self.wake_response_at = None;
                self.sleep();
            }
            TimerKind::FragmentWindow => {
                warn!(received = self.snapshot.len(), "historic transfer timed out");
                self.retry_historic();
            }
            TimerKind::NowBlockWindow => {
                debug!("now-block answer timed out");
                self.sleep();
            }
            TimerKind::PacketWindow | TimerKind::DelayedCommand => {}
        }
    }

    fn handle_disconnected(&mut self, _now: OffsetDateTime) {
        if !self.snapshot.is_empty() {
            debug!(received = self.snapshot.len(), "partial historic transfer dropped");
        }
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
        self.serial = None;
        self.wake_response_at = None;
        self.snapshot.reset();
        self.resends = 0;
        self.now_block = None;
        self.asleep = false;
    }
}
