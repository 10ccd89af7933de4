//! Dexcom G7 family (G7, ONE+, Stelo).
//!
//! The transmitter is bonded to the vendor app; this session only listens.
//! It connects alongside the official app, checks the authentication
//! status the transmitter reports, and reads the glucose and backfill
//! notifications the official app requests. The transmitter drops the
//! link itself a few seconds later.
//!
//! Readings that follow a gap are held back until the backfill arrives,
//! so that the batch reaches the reconciler in one piece and older
//! backfill samples are not rejected as replays.

use std::collections::VecDeque;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::dexcom::{AuthChallengeRx, BackfillRecord, DexcomOpcode, decode_backfill_record};
use cgm_types::frame::{BatteryStatus, DecodedFrame, DeviceFault};
use cgm_types::uuids::{
    DEXCOM_ADVERTISEMENT, DEXCOM_AUTHENTICATION, DEXCOM_BACKFILL, DEXCOM_CONTROL, DEXCOM_SERVICE,
};
use cgm_types::{DexcomGlucose, GlucoseSample, SensorError, TransmitterKind, decode_on};

use super::{Batch, DeviceSession, LinkPolicy, SessionAction, SessionCore, SessionEvent};
use crate::config::TransmitterConfig;
use crate::error::AuthenticationError;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

/// A reading this long after the previous one implies a gap to backfill.
pub const GAP_THRESHOLD: Duration = Duration::from_secs(5 * 60 + 30);

/// Identical consecutive values that mark a stuck sensor.
pub const STUCK_SENSOR_RUN: usize = 6;

/// Session state machine for the Dexcom G7 family.
#[derive(Debug)]
pub struct DexcomSession {
    core: SessionCore,
    transmitter_id: String,
    max_sensor_age_minutes: u32,

    last_reading: Option<OffsetDateTime>,
    recent_values: VecDeque<u16>,

    activation: Option<OffsetDateTime>,
    sensor_age_minutes: Option<u32>,
    pending_backfill: Vec<Vec<u8>>,
    held: Vec<GlucoseSample>,
}

impl DexcomSession {
    /// A session configured from `config`.
    pub fn new(config: &TransmitterConfig) -> Self {
        Self {
            core: SessionCore::default(),
            transmitter_id: config.transmitter_id.clone(),
            max_sensor_age_minutes: config.max_sensor_age_minutes(),
            last_reading: None,
            recent_values: VecDeque::with_capacity(STUCK_SENSOR_RUN),
            activation: None,
            sensor_age_minutes: None,
            pending_backfill: Vec::new(),
            held: Vec::new(),
        }
    }

    fn sensor_id(&self) -> String {
        if self.transmitter_id.is_empty() {
            "dexcom-g7".to_string()
        } else {
            self.transmitter_id.clone()
        }
    }

    fn deliver(&mut self, samples: Vec<GlucoseSample>) {
        if samples.is_empty() {
            return;
        }
        if let Some(newest) = samples.iter().map(|s| s.timestamp).max() {
            self.last_reading = Some(self.last_reading.map_or(newest, |last| last.max(newest)));
        }
        self.core.push(SessionAction::Deliver(Batch {
            sensor_id: self.sensor_id(),
            samples,
            sensor_age_minutes: self.sensor_age_minutes,
            max_sensor_age_minutes: Some(self.max_sensor_age_minutes),
        }));
    }

    fn on_auth(&mut self, auth: AuthChallengeRx) {
        match (auth.authenticated, auth.paired) {
            (true, true) => {
                info!("transmitter is paired and authenticated");
                self.core.push(SessionAction::Authenticated);
            }
            (false, _) => {
                warn!("transmitter is not bonded to this host");
                self.core.push(SessionAction::Reject(AuthenticationError::NotBondedByThisApp));
            }
            (true, false) => {
                warn!("transmitter requires pairing");
                self.core.push(SessionAction::Reject(AuthenticationError::PairingRequired));
            }
        }
    }

    /// Record a value and report whether the last six were identical.
    fn is_stuck(&mut self, value: u16) -> bool {
        if self.recent_values.len() == STUCK_SENSOR_RUN {
            self.recent_values.pop_front();
        }
        self.recent_values.push_back(value);
        self.recent_values.len() == STUCK_SENSOR_RUN
            && self.recent_values.iter().all(|v| *v == value)
    }

    fn on_glucose(&mut self, now: OffsetDateTime, glucose: DexcomGlucose) {
        let age_minutes = u32::try_from(glucose.sensor_age().whole_minutes()).unwrap_or(0);
        if age_minutes > self.max_sensor_age_minutes {
            warn!(age_minutes, max = self.max_sensor_age_minutes, "sensor expired, reading dropped");
            self.core.event(SessionEvent::Sensor(SensorError::SensorExpired {
                age_minutes,
                max_minutes: self.max_sensor_age_minutes,
            }));
            return;
        }

        // activation is needed for backfill even when this reading is unusable
        self.activation = Some(glucose.activation(now));
        self.sensor_age_minutes = Some(age_minutes);
        self.core.event(SessionEvent::SensorAge(age_minutes));
        self.process_pending_backfill();

        let Some(sample) = glucose.to_sample(now) else {
            debug!(state = %glucose.state, "reading without usable value");
            if glucose.state.is_terminal() || !glucose.state.is_reliable() {
                self.core.event(SessionEvent::Sensor(SensorError::SensorNotReady(
                    glucose.state.to_string(),
                )));
            }
            return;
        };

        if let Some(value) = glucose.glucose
            && self.is_stuck(value)
        {
            warn!(value, "six identical values, reading dropped");
            return;
        }

        let recent = self
            .last_reading
            .is_some_and(|last| (now - last).unsigned_abs() < GAP_THRESHOLD);
        if self.last_reading.is_none() || recent {
            debug!(value = sample.raw_value, "delivering reading");
            self.deliver(vec![sample]);
        } else {
            debug!(value = sample.raw_value, "gap detected, holding reading for backfill");
            self.held.push(sample);
        }
    }

    fn on_backfill(&mut self, bytes: &[u8]) {
        match self.activation {
            Some(activation) => {
                if let Some(record) = decode_backfill(bytes) {
                    self.held.push(record.to_sample(activation));
                }
            }
            None => {
                debug!("backfill before activation is known, queued");
                self.pending_backfill.push(bytes.to_vec());
            }
        }
    }

    fn process_pending_backfill(&mut self) {
        let Some(activation) = self.activation else {
            return;
        };
        for frame in std::mem::take(&mut self.pending_backfill) {
            if let Some(record) = decode_backfill(&frame) {
                self.held.push(record.to_sample(activation));
            }
        }
    }

    fn flush_held(&mut self) {
        self.process_pending_backfill();
        if self.held.is_empty() {
            return;
        }
        let mut held = std::mem::take(&mut self.held);
        held.sort_by_key(|s| s.timestamp);
        held.dedup_by_key(|s| s.timestamp);
        info!(count = held.len(), "flushing held readings");
        self.deliver(held);
    }
}

fn decode_backfill(bytes: &[u8]) -> Option<BackfillRecord> {
    match decode_backfill_record(bytes) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "malformed backfill record");
            None
        }
    }
}

impl DeviceSession for DexcomSession {
    fn kind(&self) -> TransmitterKind {
        TransmitterKind::DexcomG7
    }

    fn link_profile(&self) -> LinkProfile {
        LinkProfile {
            service: DEXCOM_SERVICE,
            advertised_service: Some(DEXCOM_ADVERTISEMENT),
            name_pattern: Some(if self.transmitter_id.is_empty() {
                "DX".to_string()
            } else {
                self.transmitter_id.clone()
            }),
            notify: vec![DEXCOM_AUTHENTICATION, DEXCOM_CONTROL, DEXCOM_BACKFILL],
            write: DEXCOM_CONTROL,
            authenticates: true,
        }
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::StayConnected
    }

    fn sensor_id_hint(&self) -> Option<String> {
        Some(self.sensor_id())
    }

    fn set_last_accepted(&mut self, last: Option<OffsetDateTime>) {
        if last.is_some_and(|l| self.last_reading.is_none_or(|r| l > r)) {
            self.last_reading = last;
        }
    }

    fn handle_connected(&mut self, _now: OffsetDateTime) {}

    fn handle_value(&mut self, now: OffsetDateTime, characteristic: Uuid, bytes: &[u8]) {
        if characteristic == DEXCOM_BACKFILL {
            self.on_backfill(bytes);
            return;
        }
        match decode_on(TransmitterKind::DexcomG7, characteristic, bytes) {
            DecodedFrame::AuthChallenge(auth) if characteristic == DEXCOM_AUTHENTICATION => {
                self.on_auth(auth);
            }
            DecodedFrame::GlucoseReading(glucose) if characteristic == DEXCOM_CONTROL => {
                self.on_glucose(now, glucose);
            }
            DecodedFrame::Dexcom(DexcomOpcode::BackfillFinished) => {
                debug!("backfill finished");
                self.flush_held();
            }
            DecodedFrame::BatteryStatus(BatteryStatus::Dexcom(battery)) => {
                debug!(?battery, "transmitter battery");
            }
            DecodedFrame::Error(DeviceFault::Malformed(e)) => {
                warn!(error = %e, "malformed dexcom frame");
                self.core.event(SessionEvent::Protocol(e));
            }
            other => debug!(%characteristic, frame = ?other, "dropped dexcom frame"),
        }
    }

    fn handle_timeout(&mut self, _now: OffsetDateTime, timer: TimerKind) {
        self.core.fired(timer);
    }

    fn handle_disconnected(&mut self, _now: OffsetDateTime) {
        self.flush_held();
        self.core.push(SessionAction::CycleComplete);
        self.activation = None;
        self.sensor_age_minutes = None;
        self.pending_backfill.clear();
    }

    fn poll_action(&mut self) -> Option<SessionAction> {
        self.core.poll()
    }

    fn poll_timeout(&self) -> Option<(TimerKind, OffsetDateTime)> {
        self.core.next_timeout()
    }

    fn reset(&mut self) {
        self.core.clear();
        self.activation = None;
        self.sensor_age_minutes = None;
        self.pending_backfill.clear();
        self.held.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    fn session() -> DexcomSession {
        DexcomSession::new(&TransmitterConfig::dexcom_g7("DXCMAB"))
    }

    fn drain(s: &mut DexcomSession) -> Vec<SessionAction> {
        std::iter::from_fn(|| s.poll_action()).collect()
    }

    fn batches(actions: &[SessionAction]) -> Vec<Batch> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Deliver(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn glucose(device_time: u32, value: u16) -> Vec<u8> {
        let mut m = vec![0x4e, 0x00];
        m.extend_from_slice(&device_time.to_le_bytes());
        m.extend_from_slice(&1u16.to_le_bytes());
        m.extend_from_slice(&[0x00, 0x00]);
        m.push(0);
        m.push(0x00);
        m.extend_from_slice(&value.to_le_bytes());
        m.push(0x06);
        m.push(0xfe);
        m.extend_from_slice(&0xffffu16.to_le_bytes());
        m.push(0x00);
        m
    }

    fn backfill(device_time: u32, value: u16) -> Vec<u8> {
        let t = device_time.to_le_bytes();
        let g = value.to_le_bytes();
        vec![t[0], t[1], t[2], 0x00, g[0], g[1], 0x06, 0x00, 0x7f]
    }

    const DAY: u32 = 86_400;

    #[test]
    fn test_auth_outcomes() {
        let mut s = session();
        s.handle_value(now(), DEXCOM_AUTHENTICATION, &[0x05, 0x01, 0x01]);
        assert_eq!(drain(&mut s), vec![SessionAction::Authenticated]);

        s.handle_value(now(), DEXCOM_AUTHENTICATION, &[0x05, 0x02, 0x01]);
        assert_eq!(
            drain(&mut s),
            vec![SessionAction::Reject(AuthenticationError::NotBondedByThisApp)]
        );

        s.handle_value(now(), DEXCOM_AUTHENTICATION, &[0x05, 0x01, 0x02]);
        assert_eq!(
            drain(&mut s),
            vec![SessionAction::Reject(AuthenticationError::PairingRequired)]
        );
    }

    #[test]
    fn test_first_reading_delivered_immediately() {
        let mut s = session();
        s.handle_value(now(), DEXCOM_CONTROL, &glucose(2 * DAY, 123));
        let actions = drain(&mut s);
        assert!(actions.contains(&SessionAction::Event(SessionEvent::SensorAge(2 * 1440))));
        let b = batches(&actions);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].samples, vec![GlucoseSample::new(now(), 123.0)]);
        assert_eq!(b[0].sensor_id, "DXCMAB");
    }

    #[test]
    fn test_gap_reading_held_until_disconnect() {
        let mut s = session();
        s.set_last_accepted(Some(now() - time::Duration::minutes(20)));
        s.handle_value(now(), DEXCOM_CONTROL, &glucose(2 * DAY, 130));
        assert!(batches(&drain(&mut s)).is_empty());

        for (i, value) in [110u16, 115, 120].iter().enumerate() {
            let t = 2 * DAY - 900 + 300 * u32::try_from(i).unwrap();
            s.handle_value(now(), DEXCOM_BACKFILL, &backfill(t, *value));
        }
        assert!(batches(&drain(&mut s)).is_empty());

        s.handle_disconnected(now());
        let actions = drain(&mut s);
        let b = batches(&actions);
        assert_eq!(b.len(), 1);
        let values: Vec<f64> = b[0].samples.iter().map(|s| s.raw_value).collect();
        assert_eq!(values, vec![110.0, 115.0, 120.0, 130.0]);
        assert!(b[0].samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(actions.last(), Some(&SessionAction::CycleComplete));
    }

    #[test]
    fn test_backfill_finished_flushes() {
        let mut s = session();
        s.set_last_accepted(Some(now() - time::Duration::hours(1)));
        s.handle_value(now(), DEXCOM_CONTROL, &glucose(2 * DAY, 130));
        s.handle_value(now(), DEXCOM_BACKFILL, &backfill(2 * DAY - 300, 128));
        drain(&mut s);
        s.handle_value(now(), DEXCOM_CONTROL, &[0x59, 0x00]);
        let b = batches(&drain(&mut s));
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].samples.len(), 2);
    }

    #[test]
    fn test_backfill_before_glucose_is_queued() {
        let mut s = session();
        s.set_last_accepted(Some(now() - time::Duration::hours(1)));
        s.handle_value(now(), DEXCOM_BACKFILL, &backfill(2 * DAY - 300, 128));
        assert!(s.held.is_empty());
        s.handle_value(now(), DEXCOM_CONTROL, &glucose(2 * DAY, 130));
        assert_eq!(s.held.len(), 2);
        assert_eq!(s.held[0].timestamp, now() - time::Duration::minutes(5));
    }

    #[test]
    fn test_expired_sensor_dropped() {
        let mut s = session();
        let actions = {
            s.handle_value(now(), DEXCOM_CONTROL, &glucose(11 * DAY, 123));
            drain(&mut s)
        };
        assert!(batches(&actions).is_empty());
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Event(SessionEvent::Sensor(SensorError::SensorExpired { .. }))
        )));
    }

    #[test]
    fn test_six_identical_values_suppressed() {
        let mut s = session();
        let mut delivered = 0;
        for i in 0..6u32 {
            let at = now() + time::Duration::minutes(5 * i64::from(i));
            s.handle_value(at, DEXCOM_CONTROL, &glucose(2 * DAY + 300 * i, 140));
            delivered += batches(&drain(&mut s)).len();
        }
        assert_eq!(delivered, 5);
    }

    #[test]
    fn test_unreliable_state_not_delivered() {
        let mut s = session();
        let mut msg = glucose(DAY, 100);
        msg[14] = 0x02;
        s.handle_value(now(), DEXCOM_CONTROL, &msg);
        let actions = drain(&mut s);
        assert!(batches(&actions).is_empty());
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Event(SessionEvent::Sensor(SensorError::SensorNotReady(_)))
        )));
    }

    #[test]
    fn test_reset_drops_held() {
        let mut s = session();
        s.set_last_accepted(Some(now() - time::Duration::hours(1)));
        s.handle_value(now(), DEXCOM_CONTROL, &glucose(2 * DAY, 130));
        s.reset();
        s.handle_disconnected(now());
        assert!(batches(&drain(&mut s)).is_empty());
    }
}
