//! Dexcom G5 and G6.
//!
//! Unlike the G7, these transmitters are driven by the host. Each cycle
//! the session authenticates with an AES challenge derived from the
//! transmitter ID, bonds if the transmitter asks for it, reads the
//! transmitter clock, requests the latest glucose value and, after a gap,
//! the missed readings from the backfill characteristic. The link is
//! closed once the cycle completes; the transmitter advertises again about
//! five minutes later.

use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::dexcom::{
    AuthChallengeRx, AuthRequestRx, BOND_REQUEST_TX, BackfillStream, DexcomOpcode,
    GlucoseBackfillRx, NO_SESSION, TransmitterTimeRx, auth_challenge_tx, auth_request_tx,
    backfill_tx, challenge_hash, control_request, keep_alive_tx,
};
use cgm_types::frame::{BatteryStatus, DecodedFrame, DeviceFault, SensorStatus};
use cgm_types::uuids::{
    DEXCOM_ADVERTISEMENT, DEXCOM_AUTHENTICATION, DEXCOM_BACKFILL, DEXCOM_CONTROL, DEXCOM_SERVICE,
};
use cgm_types::{DexcomGlucose, GlucoseSample, SensorError, TransmitterKind, decode_on};

use super::dexcom::GAP_THRESHOLD;
use super::{Batch, DeviceSession, LinkPolicy, SessionAction, SessionCore, SessionEvent};
use crate::config::TransmitterConfig;
use crate::error::AuthenticationError;
use crate::link::LinkProfile;
use crate::scheduler::TimerKind;

/// Seconds the transmitter keeps the link open while the host bonds.
pub const BOND_KEEP_ALIVE_SECS: u8 = 25;

/// How long to wait for the bond to complete.
pub const BOND_WINDOW: Duration = Duration::from_secs(30);

/// Backfill never reaches further back than this.
pub const MAX_BACKFILL: Duration = Duration::from_secs(6 * 60 * 60);

/// Where the session is in the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    AwaitChallenge,
    AwaitAuthStatus,
    AwaitBond,
    AwaitTime,
    AwaitGlucose,
    AwaitBackfill,
    Done,
}

/// Session state machine for the Dexcom G5 and G6.
#[derive(Debug)]
pub struct DexcomG5Session {
    core: SessionCore,
    kind: TransmitterKind,
    transmitter_id: String,
    max_sensor_age_minutes: u32,
    step_timeout: Duration,
    last_accepted: Option<OffsetDateTime>,

    step: Step,
    token: [u8; 8],
    activation: Option<OffsetDateTime>,
    sensor_age_minutes: Option<u32>,
    backfill: BackfillStream,
    held: Vec<GlucoseSample>,
}

impl DexcomG5Session {
    /// A session configured from `config`; G5 unless the kind says G6.
    pub fn new(config: &TransmitterConfig) -> Self {
        let kind = if config.kind == TransmitterKind::DexcomG6 {
            TransmitterKind::DexcomG6
        } else {
            TransmitterKind::DexcomG5
        };
        Self {
            core: SessionCore::default(),
            kind,
            transmitter_id: config.transmitter_id.clone(),
            max_sensor_age_minutes: config.max_sensor_age_minutes(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            last_accepted: None,
            step: Step::Idle,
            token: [0; 8],
            activation: None,
            sensor_age_minutes: None,
            backfill: BackfillStream::new(),
            held: Vec::new(),
        }
    }

    fn expect(&mut self, now: OffsetDateTime, step: Step) {
        self.step = step;
        let window = if step == Step::AwaitBond {
            BOND_WINDOW
        } else {
            self.step_timeout
        };
        self.core.set_timer(now, TimerKind::AckWindow, window);
    }

    fn control(&mut self, now: OffsetDateTime, opcode: DexcomOpcode, next: Step) {
        self.core.write(DEXCOM_CONTROL, control_request(opcode), true);
        self.expect(now, next);
    }

    fn finish(&mut self) {
        if self.step == Step::Done {
            return;
        }
        self.step = Step::Done;
        self.core.cancel_timer(TimerKind::AckWindow);
        self.flush_held();
        self.core.push(SessionAction::CycleComplete);
    }

    fn not_ready(&mut self, reason: impl Into<String>) {
        self.core.event(SessionEvent::Sensor(SensorError::SensorNotReady(reason.into())));
        self.finish();
    }

    fn on_challenge(&mut self, now: OffsetDateTime, request: AuthRequestRx) {
        match challenge_hash(&self.transmitter_id, &request.challenge) {
            Ok(hash) => {
                if challenge_hash(&self.transmitter_id, &self.token).ok() != Some(request.token_hash) {
                    debug!("transmitter token hash differs from ours");
                }
                self.core.write(DEXCOM_AUTHENTICATION, auth_challenge_tx(hash), true);
                self.expect(now, Step::AwaitAuthStatus);
            }
            Err(e) => {
                warn!(error = %e, "cannot answer authentication challenge");
                self.core.event(SessionEvent::Protocol(e));
                self.step = Step::Done;
                self.core.cancel_timer(TimerKind::AckWindow);
                self.core.push(SessionAction::Reject(AuthenticationError::NotBondedByThisApp));
            }
        }
    }

    fn on_auth_status(&mut self, now: OffsetDateTime, auth: AuthChallengeRx) {
        if !auth.authenticated {
            warn!(id = %self.transmitter_id, "transmitter rejected the challenge answer");
            self.step = Step::Done;
            self.core.cancel_timer(TimerKind::AckWindow);
            self.core.push(SessionAction::Reject(AuthenticationError::NotBondedByThisApp));
        } else if auth.paired {
            self.on_authenticated(now);
        } else {
            info!("transmitter asks for bonding");
            self.core.write(DEXCOM_AUTHENTICATION, keep_alive_tx(BOND_KEEP_ALIVE_SECS), true);
            self.core.write(DEXCOM_AUTHENTICATION, BOND_REQUEST_TX, true);
            self.expect(now, Step::AwaitBond);
        }
    }

    fn on_authenticated(&mut self, now: OffsetDateTime) {
        info!("transmitter authenticated");
        self.core.push(SessionAction::Authenticated);
        self.control(now, DexcomOpcode::TransmitterTimeTx, Step::AwaitTime);
    }

    fn on_time(&mut self, now: OffsetDateTime, time: TransmitterTimeRx) {
        if time.status != 0 {
            warn!(status = time.status, "transmitter time request refused");
            self.finish();
            return;
        }
        self.activation = Some(time.activation(now));
        if time.session_start_time == NO_SESSION {
            self.not_ready("no sensor session");
            return;
        }
        let age_minutes = time.current_time.saturating_sub(time.session_start_time) / 60;
        self.sensor_age_minutes = Some(age_minutes);
        self.core.event(SessionEvent::SensorAge(age_minutes));
        if age_minutes > self.max_sensor_age_minutes {
            warn!(age_minutes, max = self.max_sensor_age_minutes, "sensor expired");
            self.core.event(SessionEvent::Sensor(SensorError::SensorExpired {
                age_minutes,
                max_minutes: self.max_sensor_age_minutes,
            }));
            self.finish();
            return;
        }
        let request = match self.kind {
            TransmitterKind::DexcomG6 => DexcomOpcode::GlucoseG6Tx,
            _ => DexcomOpcode::GlucoseTx,
        };
        self.control(now, request, Step::AwaitGlucose);
    }

    fn on_glucose(&mut self, now: OffsetDateTime, glucose: DexcomGlucose) {
        let Some(activation) = self.activation else {
            debug!("glucose before transmitter time, ignored");
            return;
        };
        let measured = activation + time::Duration::seconds(i64::from(glucose.device_time));
        let value = match glucose.glucose {
            Some(value) if glucose.state.is_reliable() => value,
            _ => {
                debug!(state = %glucose.state, "reading without usable value");
                self.not_ready(glucose.state.to_string());
                return;
            }
        };
        self.held.push(GlucoseSample::new(measured, f64::from(value)));

        let recent = self
            .last_accepted
            .is_some_and(|last| (measured - last).unsigned_abs() < GAP_THRESHOLD);
        if recent {
            self.finish();
            return;
        }
        let from = self
            .last_accepted
            .map_or(now - MAX_BACKFILL, |last| last.max(now - MAX_BACKFILL));
        let start = device_time(activation, from);
        if start >= glucose.device_time {
            self.finish();
            return;
        }
        info!(start, end = glucose.device_time, "gap detected, requesting backfill");
        self.backfill.reset();
        self.core
            .write(DEXCOM_CONTROL, backfill_tx(start, glucose.device_time), true);
        self.expect(now, Step::AwaitBackfill);
    }

    fn on_backfill_packet(&mut self, now: OffsetDateTime, bytes: &[u8]) {
        if self.step != Step::AwaitBackfill {
            debug!("backfill packet outside a backfill request, ignored");
            return;
        }
        if !self.backfill.push(bytes) {
            debug!("out of sequence backfill packet dropped");
        }
        self.core.set_timer(now, TimerKind::AckWindow, self.step_timeout);
    }

    fn on_backfill_complete(&mut self, response: GlucoseBackfillRx) {
        if response.status != 0 {
            warn!(status = response.status, "backfill request refused");
        }
        debug!(
            start = response.start_time,
            end = response.end_time,
            "backfill complete"
        );
        self.finish();
    }

    fn flush_held(&mut self) {
        if let Some(activation) = self.activation {
            self.held
                .extend(self.backfill.decode().iter().map(|r| r.to_sample(activation)));
        }
        self.backfill.reset();
        if self.held.is_empty() {
            return;
        }
        let mut samples = std::mem::take(&mut self.held);
        samples.sort_by_key(|s| s.timestamp);
        samples.dedup_by_key(|s| s.timestamp);
        debug!(count = samples.len(), "delivering readings");
        self.core.push(SessionAction::Deliver(Batch {
            sensor_id: self.transmitter_id.clone(),
            samples,
            sensor_age_minutes: self.sensor_age_minutes,
            max_sensor_age_minutes: Some(self.max_sensor_age_minutes),
        }));
    }
}

/// Seconds between activation and `at`, clamped to the device clock range.
fn device_time(activation: OffsetDateTime, at: OffsetDateTime) -> u32 {
    u32::try_from((at - activation).whole_seconds().max(0)).unwrap_or(u32::MAX)
}

impl DeviceSession for DexcomG5Session {
    fn kind(&self) -> TransmitterKind {
        self.kind
    }

    fn link_profile(&self) -> LinkProfile {
        let suffix = self
            .transmitter_id
            .get(self.transmitter_id.len().saturating_sub(2)..)
            .unwrap_or_default();
        LinkProfile {
            service: DEXCOM_SERVICE,
            advertised_service: Some(DEXCOM_ADVERTISEMENT),
            name_pattern: Some(format!("Dexcom{suffix}")),
            notify: vec![DEXCOM_AUTHENTICATION, DEXCOM_CONTROL, DEXCOM_BACKFILL],
            write: DEXCOM_CONTROL,
            authenticates: true,
        }
    }

    fn link_policy(&self) -> LinkPolicy {
        LinkPolicy::DisconnectAfterCycle
    }

    fn sensor_id_hint(&self) -> Option<String> {
        Some(self.transmitter_id.clone())
    }

    fn set_last_accepted(&mut self, last: Option<OffsetDateTime>) {
        self.last_accepted = last;
    }

    fn handle_connected(&mut self, now: OffsetDateTime) {
        self.reset();
        self.token = rand::rng().random();
        self.core.write(DEXCOM_AUTHENTICATION, auth_request_tx(self.token), true);
        self.expect(now, Step::AwaitChallenge);
    }

    fn handle_value(&mut self, now: OffsetDateTime, characteristic: Uuid, bytes: &[u8]) {
        if characteristic == DEXCOM_BACKFILL {
            self.on_backfill_packet(now, bytes);
            return;
        }
        match (self.step, decode_on(self.kind, characteristic, bytes)) {
            (Step::AwaitChallenge, DecodedFrame::AuthRequest(request)) => {
                self.on_challenge(now, request);
            }
            (Step::AwaitAuthStatus | Step::AwaitBond, DecodedFrame::AuthChallenge(auth)) => {
                self.on_auth_status(now, auth);
            }
            (Step::AwaitBond, DecodedFrame::Dexcom(DexcomOpcode::PairRequestRx)) => {
                self.on_authenticated(now);
            }
            (Step::AwaitTime, DecodedFrame::SensorState(SensorStatus::TransmitterTime(t))) => {
                self.on_time(now, t);
            }
            (Step::AwaitGlucose, DecodedFrame::GlucoseReading(glucose)) => {
                self.on_glucose(now, glucose);
            }
            (Step::AwaitBackfill, DecodedFrame::BackfillComplete(response)) => {
                self.on_backfill_complete(response);
            }
            (_, DecodedFrame::BatteryStatus(BatteryStatus::Dexcom(battery))) => {
                debug!(?battery, "transmitter battery");
            }
            (_, DecodedFrame::Error(DeviceFault::Malformed(e))) => {
                warn!(error = %e, "malformed dexcom frame");
                self.core.event(SessionEvent::Protocol(e));
            }
            (step, other) => debug!(?step, %characteristic, frame = ?other, "dropped dexcom frame"),
        }
    }

    fn handle_timeout(&mut self, _now: OffsetDateTime, timer: TimerKind) {
        if !self.core.fired(timer) || timer != TimerKind::AckWindow {
            return;
        }
        match self.step {
            Step::AwaitBond => {
                warn!("bonding did not complete");
                self.step = Step::Done;
                self.core.push(SessionAction::Reject(AuthenticationError::PairingRequired));
            }
            Step::AwaitBackfill => {
                info!("backfill stream went quiet");
                self.finish();
            }
            step => {
                warn!(?step, "no response from transmitter");
                self.finish();
            }
        }
    }

    fn handle_disconnected(&mut self, _now: OffsetDateTime) {
        if self.step != Step::Done && self.step != Step::Idle {
            self.finish();
        }
        self.step = Step::Idle;
    }

    fn poll_action(&mut self) -> Option<SessionAction> {
        self.core.poll()
    }

    fn poll_timeout(&self) -> Option<(TimerKind, OffsetDateTime)> {
        self.core.next_timeout()
    }

    fn reset(&mut self) {
        self.core.clear();
        self.step = Step::Idle;
        self.activation = None;
        self.sensor_age_minutes = None;
        self.backfill.reset();
        self.held.clear();
    }
}
