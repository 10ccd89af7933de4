//! One transmitter, end to end.
//!
//! [`TransmitterCoordinator`] owns a [`BleLinkManager`], the vendor
//! [`DeviceSession`] and the [`DedupeWatermark`]. It feeds link events and
//! expired timers into the session, carries out the session's actions, and
//! passes delivered batches through the [`SampleReconciler`] into the
//! [`GlucoseStore`]. Side-channel conditions go to the [`AlertSink`] and
//! the event broadcast; none of them hold back sample delivery.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cgm_core::{
//!     BtleplugRadio, EventDispatcher, MemoryStore, NoopAlerts, SystemClock,
//!     TransmitterConfig, TransmitterCoordinator, session,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> cgm_core::Result<()> {
//! let config = TransmitterConfig::miaomiao();
//! let mut coordinator = TransmitterCoordinator::new(
//!     Arc::new(BtleplugRadio::new().await?),
//!     session::for_config(&config),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(NoopAlerts),
//!     Arc::new(SystemClock),
//!     config,
//!     EventDispatcher::default(),
//! )?;
//! coordinator.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cgm_types::{GlucoseSample, ProtocolError, SensorError};

use crate::config::TransmitterConfig;
use crate::error::{AuthenticationError, Error, LinkError, Result};
use crate::events::{CgmEvent, DeviceId, EventDispatcher};
use crate::link::{BleLinkManager, ConnectionState, LinkEvent};
use crate::radio::RadioStack;
use crate::reconcile::{DedupeWatermark, SampleReconciler};
use crate::scheduler::{Clock, Scheduler};
use crate::session::{Batch, DeviceSession, LinkPolicy, SessionAction, SessionEvent};
use crate::store::{AlertSink, GlucoseStore};

/// Pause before the next cycle after a recoverable failure.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Outcome of one [`TransmitterCoordinator::poll_cycle`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// The session reported the end of its cycle.
    pub completed: bool,
    /// The cycle deadline passed first.
    pub timed_out: bool,
    /// Samples stored during the cycle, oldest first.
    pub accepted: Vec<GlucoseSample>,
    /// New samples dropped for being outside the physiological range.
    pub out_of_range: usize,
    pub sensor_errors: Vec<SensorError>,
    pub protocol_errors: Vec<ProtocolError>,
    /// Set when the transmitter refused this host.
    pub rejected: Option<AuthenticationError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    EndCycle,
}

/// Drives one transmitter through repeated connection cycles.
pub struct TransmitterCoordinator<R: RadioStack> {
    link: BleLinkManager<R>,
    session: Box<dyn DeviceSession>,
    scheduler: Scheduler,
    reconciler: SampleReconciler,
    store: Arc<dyn GlucoseStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: TransmitterConfig,
    dispatcher: EventDispatcher,
    watermark: DedupeWatermark,
    sensor_id: Option<String>,
}

impl<R: RadioStack> std::fmt::Debug for TransmitterCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitterCoordinator")
            .field("kind", &self.session.kind())
            .field("link", &self.link)
            .field("watermark", &self.watermark)
            .field("sensor_id", &self.sensor_id)
            .finish_non_exhaustive()
    }
}

impl<R: RadioStack> TransmitterCoordinator<R> {
    /// Wire a coordinator together. Nothing touches the radio until
    /// [`poll_cycle`](Self::poll_cycle) or [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when `config` does not validate.
    pub fn new(
        radio: Arc<R>,
        session: Box<dyn DeviceSession>,
        store: Arc<dyn GlucoseStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: TransmitterConfig,
        dispatcher: EventDispatcher,
    ) -> Result<Self> {
        config.validate()?;
        let link = BleLinkManager::new(
            radio,
            session.link_profile(),
            config.link_options(),
            dispatcher.clone(),
        );
        Ok(Self {
            link,
            session,
            scheduler: Scheduler::new(Arc::clone(&clock)),
            reconciler: config.reconciler(),
            store,
            alerts,
            clock,
            config,
            dispatcher,
            watermark: DedupeWatermark::unknown(),
            sensor_id: None,
        })
    }

    /// Current link state.
    pub fn link_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Newest accepted timestamp of the current sensor.
    pub fn watermark(&self) -> DedupeWatermark {
        self.watermark
    }

    /// Serial or transmitter ID of the sensor being read.
    pub fn sensor_id(&self) -> Option<&str> {
        self.sensor_id.as_deref()
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransmitterConfig {
        &self.config
    }

    /// Run one connection cycle.
    ///
    /// Starts scanning when the link is idle, then handles link events,
    /// session actions and timers until the session completes its cycle, a
    /// transmitter is rejected, or the cycle deadline passes.
    ///
    /// # Errors
    ///
    /// [`LinkError::BluetoothUnavailable`] when the adapter is off. Wire and
    /// sensor problems are reported in the [`CycleReport`] instead.
    pub async fn poll_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.link.recover_interrupted().await;
        self.ensure_link().await?;

        let clock = Arc::clone(&self.clock);
        let mut deadline = clock.sleep(self.config.cycle_timeout());
        loop {
            let flow = tokio::select! {
                event = self.link.next_event() => self.on_link_event(event, &mut report).await?,
                () = self.scheduler.sleep_until_next() => self.on_timers(&mut report).await,
                () = &mut deadline => {
                    report.timed_out = true;
                    Flow::EndCycle
                }
            };
            if flow == Flow::EndCycle {
                break;
            }
        }

        self.link.recover_interrupted().await;
        if report.timed_out {
            debug!(state = %self.link.state(), "cycle deadline passed");
            if self.session.link_policy() == LinkPolicy::DisconnectAfterCycle && self.link.state().is_link_up() {
                self.end_connection(false).await;
            }
        }
        Ok(report)
    }

    /// Run cycles until `cancel` fires.
    ///
    /// Transmitters that disconnect after each cycle are polled again after
    /// the configured interval.
    ///
    /// # Errors
    ///
    /// Errors that retrying cannot fix, such as invalid configuration.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let clock = Arc::clone(&self.clock);
        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.poll_cycle() => outcome,
            };
            let pause = match outcome {
                Ok(report) => {
                    debug!(
                        completed = report.completed,
                        timed_out = report.timed_out,
                        accepted = report.accepted.len(),
                        "cycle finished"
                    );
                    let polled = self.session.link_policy() == LinkPolicy::DisconnectAfterCycle;
                    (polled && report.completed).then(|| self.config.poll_interval())
                }
                Err(e) if e.is_retryable() || matches!(e, Error::Link(LinkError::BluetoothUnavailable)) => {
                    warn!(error = %e, "cycle failed");
                    Some(RETRY_PAUSE)
                }
                Err(e) => return Err(e),
            };
            if let Some(pause) = pause {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = clock.sleep(pause) => {}
                }
            }
        }
        info!("coordinator stopped");
        self.scheduler.clear();
        self.session.reset();
        self.link.disconnect(false).await;
        Ok(())
    }

    /// A different sensor is attached: forget the watermark and tell the
    /// alert sink.
    pub fn on_new_sensor_detected(&mut self, serial: Option<&str>) {
        info!(serial, "new sensor detected");
        self.watermark.reset();
        self.session.set_last_accepted(None);
        self.alerts.new_sensor(serial);
        self.dispatcher.send(CgmEvent::NewSensor {
            serial: serial.map(str::to_string),
        });
    }

    /// Forward the transmitter battery level.
    pub fn on_battery_level(&self, percent: u8) {
        debug!(percent, "battery level");
        self.alerts.battery_level(percent);
        self.dispatcher.send(CgmEvent::BatteryLevel { percent });
    }

    /// Forward the sensor age.
    pub fn on_sensor_age(&self, minutes: u32) {
        debug!(minutes, "sensor age");
        self.alerts.sensor_age(minutes);
        self.dispatcher.send(CgmEvent::SensorAge { minutes });
    }

    /// Forward a sensor condition.
    pub fn on_sensor_error(&self, error: &SensorError) {
        warn!(%error, "sensor error");
        self.alerts.sensor_error(error);
        self.dispatcher.send(CgmEvent::SensorError {
            message: error.to_string(),
        });
    }

    async fn ensure_link(&mut self) -> Result<()> {
        if self.link.state() != ConnectionState::Disconnected || self.link.is_reconnect_pending() {
            return Ok(());
        }
        let target = self.link.profile().scan_target();
        match self.link.start_scanning(target).await {
            Err(Error::Link(LinkError::AlreadyScanning | LinkError::AlreadyConnected)) => Ok(()),
            other => other,
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent, report: &mut CycleReport) -> Result<Flow> {
        let now = self.clock.now();
        match event {
            LinkEvent::Connected => {
                self.scheduler.clear();
                self.session.reset();
                match (self.sensor_id.clone(), self.session.sensor_id_hint()) {
                    (None, Some(hint)) => self.observe_sensor(&hint).await,
                    (Some(id), _) if self.watermark.is_unknown() => self.load_watermark(&id).await,
                    _ => {}
                }
                self.session.set_last_accepted(self.watermark.get());
                self.session.handle_connected(now);
            }
            LinkEvent::Value { characteristic, bytes } => {
                self.session.handle_value(now, characteristic, &bytes);
            }
            LinkEvent::Disconnected { will_reconnect } => {
                debug!(will_reconnect, "transmitter disconnected");
                self.scheduler.clear();
                self.session.handle_disconnected(now);
                let flow = self.drain(report).await;
                self.session.reset();
                return Ok(flow);
            }
            LinkEvent::AdapterUnavailable => {
                self.scheduler.clear();
                self.session.reset();
                return Err(Error::Link(LinkError::BluetoothUnavailable));
            }
        }
        Ok(self.drain(report).await)
    }

    async fn on_timers(&mut self, report: &mut CycleReport) -> Flow {
        let now = self.clock.now();
        for timer in self.scheduler.pop_expired(now) {
            debug!(?timer, "timer expired");
            self.session.handle_timeout(now, timer);
        }
        self.drain(report).await
    }

    /// Carry out queued session actions in order.
    async fn drain(&mut self, report: &mut CycleReport) -> Flow {
        let mut flow = Flow::Continue;
        while let Some(action) = self.session.poll_action() {
            match action {
                SessionAction::Write {
                    characteristic,
                    bytes,
                    require_ack,
                } => {
                    if let Err(e) = self.link.write(&bytes, characteristic, require_ack).await {
                        warn!(%characteristic, error = %e, "write failed, dropping link");
                        self.end_connection(true).await;
                        return Flow::Continue;
                    }
                }
                SessionAction::Deliver(batch) => self.accept_batch(batch, report).await,
                SessionAction::Event(event) => self.on_session_event(event, report).await,
                SessionAction::SetTimer(kind, after) => self.scheduler.schedule_after(kind, after),
                SessionAction::CancelTimer(kind) => {
                    self.scheduler.cancel(kind);
                }
                SessionAction::Disconnect { reconnect } => {
                    self.end_connection(reconnect).await;
                    return flow;
                }
                SessionAction::Reject(reason) => {
                    self.reject(reason, report).await;
                    return Flow::EndCycle;
                }
                SessionAction::Authenticated => self.link.mark_authenticated(),
                SessionAction::CycleComplete => {
                    report.completed = true;
                    flow = Flow::EndCycle;
                }
            }
        }
        if flow == Flow::EndCycle && self.session.link_policy() == LinkPolicy::DisconnectAfterCycle {
            self.end_connection(false).await;
        }
        flow
    }

    async fn end_connection(&mut self, reconnect: bool) {
        self.scheduler.clear();
        self.session.reset();
        self.link.disconnect(reconnect).await;
    }

    async fn reject(&mut self, reason: AuthenticationError, report: &mut CycleReport) {
        report.rejected = Some(reason);
        self.scheduler.clear();
        self.session.reset();
        let Some(id) = self.link.peripheral().map(str::to_string) else {
            return;
        };
        self.dispatcher.send(CgmEvent::Rejected {
            device: DeviceId::new(id.clone()),
            reason,
        });
        if let Err(e) = self.link.reject(&id, self.config.rejection_cooldown()).await {
            warn!(error = %e, "could not resume scanning after rejection");
        }
    }

    async fn accept_batch(&mut self, batch: Batch, report: &mut CycleReport) {
        if let (Some(age), Some(max)) = (batch.sensor_age_minutes, batch.max_sensor_age_minutes)
            && age > max
        {
            let error = SensorError::SensorExpired {
                age_minutes: age,
                max_minutes: max,
            };
            self.on_sensor_error(&error);
            report.sensor_errors.push(error);
            return;
        }

        self.observe_sensor(&batch.sensor_id).await;
        let reconciled = self.reconciler.reconcile(&batch.samples, self.watermark);
        report.out_of_range += reconciled.out_of_range;
        let Some(newest) = reconciled.accepted.last().map(|s| s.timestamp) else {
            debug!(candidates = batch.samples.len(), "nothing new in batch");
            return;
        };

        if let Err(e) = self
            .store
            .store_new_readings(&batch.sensor_id, &reconciled.accepted)
            .await
        {
            warn!(error = %e, "storing readings failed");
            return;
        }
        self.watermark = reconciled.watermark;
        self.session.set_last_accepted(self.watermark.get());

        let count = reconciled.accepted.len();
        info!(sensor = %batch.sensor_id, count, %newest, "samples accepted");
        self.dispatcher.send(CgmEvent::SamplesAccepted {
            sensor_id: Some(batch.sensor_id),
            count,
            newest,
        });
        report.accepted.extend(reconciled.accepted);
    }

    async fn on_session_event(&mut self, event: SessionEvent, report: &mut CycleReport) {
        match event {
            SessionEvent::SensorSerial(serial) => self.observe_sensor(&serial).await,
            SessionEvent::NewSensorDetected => {
                self.sensor_id = None;
                self.on_new_sensor_detected(None);
            }
            SessionEvent::BatteryLevel(percent) => self.on_battery_level(percent),
            SessionEvent::SensorAge(minutes) => self.on_sensor_age(minutes),
            SessionEvent::Sensor(error) => {
                self.on_sensor_error(&error);
                report.sensor_errors.push(error);
            }
            SessionEvent::Protocol(error) => {
                warn!(%error, "protocol error");
                report.protocol_errors.push(error);
            }
            SessionEvent::Firmware { firmware, hardware } => {
                debug!(%firmware, %hardware, "transmitter revision");
                self.alerts.transmitter_info(&firmware, &hardware);
            }
        }
    }

    /// Track the sensor being read, treating a change of identity as a
    /// new sensor.
    async fn observe_sensor(&mut self, id: &str) {
        match self.sensor_id.as_deref() {
            Some(current) if current == id => return,
            Some(_) => {
                self.sensor_id = Some(id.to_string());
                self.on_new_sensor_detected(Some(id));
            }
            None => self.sensor_id = Some(id.to_string()),
        }
        self.load_watermark(id).await;
    }

    async fn load_watermark(&mut self, sensor_id: &str) {
        match self.store.latest_stored_timestamp(sensor_id).await {
            Ok(Some(latest)) => {
                debug!(sensor = sensor_id, %latest, "watermark from store");
                self.watermark.advance(latest);
            }
            Ok(None) => {}
            Err(e) => warn!(sensor = sensor_id, error = %e, "could not read stored watermark"),
        }
        self.session.set_last_accepted(self.watermark.get());
    }

    /// Current time on the coordinator's clock.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}
