//! Vendor-agnostic BLE connection state machine.
//!
//! [`BleLinkManager`] keeps a best-effort connection to one transmitter:
//!
//! ```text
//! Disconnected -> Scanning -> Connecting -> DiscoveringServices
//!     -> DiscoveringCharacteristics -> [Authenticating] -> Subscribed -> Streaming
//! ```
//!
//! Any state falls back to `Disconnected` on link loss or a failed step.
//! Once a peripheral identity is known, connection failures are retried
//! forever by identity with exponential backoff; scanning is never retried
//! automatically. A connection attempt that outlives the watchdog is torn
//! down and the scan restarted.
//!
//! All radio callbacks funnel through [`BleLinkManager::next_event`], which
//! the coordinator drives from a single task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, LinkError, Result};
use crate::events::{CgmEvent, DeviceId, EventDispatcher};
use crate::radio::{AdapterState, Advertisement, RadioEvent, RadioStack, ScanTarget, WriteKind};
use crate::reconnect::{Backoff, ReconnectOptions};
use crate::retry::{RetryConfig, with_retry};

/// Default timeout for each discovery or write step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit for a connection attempt before rescanning.
pub const DEFAULT_CONNECTING_WATCHDOG: Duration = Duration::from_secs(5);

/// Default time a rejected transmitter is ignored.
pub const DEFAULT_REJECTION_COOLDOWN: Duration = Duration::from_secs(180);

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Authenticating,
    Subscribed,
    Streaming,
}

impl ConnectionState {
    /// Whether a connection exists or is being set up.
    #[must_use]
    pub fn is_link_up(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Scanning)
    }

    /// Whether notifications flow and writes are allowed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticating | ConnectionState::Subscribed | ConnectionState::Streaming
        )
    }

    /// Whether the state is a step of connection setup.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// GATT layout and discovery hints of one transmitter family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProfile {
    /// Service holding the characteristics below.
    pub service: Uuid,
    /// Service UUID in advertisements, when the vendor advertises one.
    pub advertised_service: Option<Uuid>,
    /// Case-insensitive name substring to match while scanning.
    pub name_pattern: Option<String>,
    /// Characteristics to subscribe to.
    pub notify: Vec<Uuid>,
    /// Characteristic commands are written to.
    pub write: Uuid,
    /// Whether the transmitter authenticates before streaming.
    pub authenticates: bool,
}

impl LinkProfile {
    /// Scan target built from the advertised service and name pattern.
    #[must_use]
    pub fn scan_target(&self) -> ScanTarget {
        ScanTarget {
            name: self.name_pattern.clone(),
            service: self.advertised_service,
            identity: None,
        }
    }
}

/// Timing of the link state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    /// Timeout for service discovery, subscription and each write.
    pub step_timeout: Duration,
    /// Connection attempts longer than this are abandoned and the scan restarted.
    pub connecting_watchdog: Duration,
    /// Backoff for reconnecting to a known identity.
    pub reconnect: ReconnectOptions,
    /// How long a rejected transmitter is skipped.
    pub rejection_cooldown: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            connecting_watchdog: DEFAULT_CONNECTING_WATCHDOG,
            reconnect: ReconnectOptions::default(),
            rejection_cooldown: DEFAULT_REJECTION_COOLDOWN,
        }
    }
}

/// What the coordinator sees of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Characteristics found and notifications enabled.
    Connected,
    /// A notification from the connected transmitter.
    Value { characteristic: Uuid, bytes: Vec<u8> },
    /// The link dropped.
    Disconnected { will_reconnect: bool },
    /// The adapter is off or gone.
    AdapterUnavailable,
}

/// Connection state machine for one transmitter.
pub struct BleLinkManager<R: RadioStack> {
    radio: Arc<R>,
    events_rx: broadcast::Receiver<RadioEvent>,
    profile: LinkProfile,
    options: LinkOptions,
    state: ConnectionState,
    target: Option<ScanTarget>,
    peripheral: Option<String>,
    peripheral_name: Option<String>,
    auto_reconnect: bool,
    backoff: Backoff,
    rejected: HashMap<String, Instant>,
    pending: VecDeque<LinkEvent>,
    dispatcher: EventDispatcher,
    reconnect_at: Option<Instant>,
}

impl<R: RadioStack> std::fmt::Debug for BleLinkManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLinkManager")
            .field("state", &self.state)
            .field("peripheral", &self.peripheral)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_at", &self.reconnect_at)
            .finish_non_exhaustive()
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<R: RadioStack> BleLinkManager<R> {
    /// Create a manager; nothing happens until [`start_scanning`] or [`connect`].
    ///
    /// [`start_scanning`]: Self::start_scanning
    /// [`connect`]: Self::connect
    pub fn new(radio: Arc<R>, profile: LinkProfile, options: LinkOptions, dispatcher: EventDispatcher) -> Self {
        let events_rx = radio.events();
        let backoff = Backoff::new(options.reconnect.clone());
        Self {
            radio,
            events_rx,
            profile,
            options,
            state: ConnectionState::Disconnected,
            target: None,
            peripheral: None,
            peripheral_name: None,
            auto_reconnect: false,
            backoff,
            rejected: HashMap::new(),
            pending: VecDeque::new(),
            dispatcher,
            reconnect_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity of the current or last connected peripheral.
    pub fn peripheral(&self) -> Option<&str> {
        self.peripheral.as_deref()
    }

    /// GATT profile in use.
    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    /// Whether a reconnection attempt is scheduled.
    pub fn is_reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// The radio this manager drives.
    pub fn radio(&self) -> &Arc<R> {
        &self.radio
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "link state");
            self.state = state;
            self.dispatcher.send(CgmEvent::StateChanged { state });
        }
    }

    fn device_id(&self) -> DeviceId {
        let id = self.peripheral.clone().unwrap_or_default();
        match &self.peripheral_name {
            Some(name) => DeviceId::with_name(id, name.clone()),
            None => DeviceId::new(id),
        }
    }

    /// Start looking for a transmitter matching `target`.
    ///
    /// A known peripheral identity is added to the target so that the same
    /// transmitter is picked up again even if its name changed.
    ///
    /// # Errors
    ///
    /// [`LinkError::AlreadyConnected`] or [`LinkError::AlreadyScanning`] when
    /// called redundantly, [`LinkError::BluetoothUnavailable`] when the adapter
    /// is off. Scan failures are not retried.
    pub async fn start_scanning(&mut self, target: ScanTarget) -> Result<()> {
        if self.state.is_link_up() {
            return Err(Error::Link(LinkError::AlreadyConnected));
        }
        if self.state == ConnectionState::Scanning {
            return Err(Error::Link(LinkError::AlreadyScanning));
        }
        if !self.radio.adapter_state().await?.is_usable() {
            return Err(Error::Link(LinkError::BluetoothUnavailable));
        }
        let target = match (&target.identity, &self.peripheral) {
            (None, Some(known)) => target.with_identity(known.clone()),
            _ => target,
        };
        self.radio.start_scan(&target.scan_services()).await?;
        info!(name = ?target.name, service = ?target.service, "scanning");
        self.target = Some(target);
        self.auto_reconnect = true;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Scanning);
        Ok(())
    }

    /// Connect to a known peripheral and set it up.
    ///
    /// On failure a retry with the same identity is scheduled and the error
    /// is returned; [`next_event`](Self::next_event) carries out the retry.
    ///
    /// # Errors
    ///
    /// [`LinkError::DeviceRejected`] while `id` is cooling down,
    /// [`LinkError::AlreadyConnected`] if it is already connected, or the
    /// error of the failed setup step.
    pub async fn connect(&mut self, id: &str) -> Result<()> {
        if let Some(remaining) = self.is_rejected(id) {
            return Err(Error::Link(LinkError::DeviceRejected {
                id: id.to_string(),
                remaining,
            }));
        }
        if self.state.is_link_up() {
            return Err(Error::Link(LinkError::AlreadyConnected));
        }
        if self.state == ConnectionState::Scanning
            && let Err(e) = self.radio.stop_scan().await
        {
            debug!(error = %e, "stop_scan failed");
        }
        if self.peripheral.as_deref() != Some(id) {
            self.peripheral_name = None;
        }
        self.peripheral = Some(id.to_string());
        self.auto_reconnect = true;
        self.reconnect_at = None;
        self.attempt(id).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %id))]
    async fn attempt(&mut self, id: &str) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let watchdog = self.options.connecting_watchdog;
        match timeout(watchdog, self.radio.connect(id)).await {
            Err(_) => {
                warn!(?watchdog, "connection attempt stalled, rescanning");
                self.rescan(id).await;
                return Err(Error::Link(LinkError::ConnectTimeout(id.to_string())));
            }
            Ok(Err(e)) => {
                self.fail_connection(id, &e).await;
                return Err(e);
            }
            Ok(Ok(())) => {}
        }
        if let Err(e) = self.set_up(id).await {
            self.fail_connection(id, &e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn set_up(&mut self, id: &str) -> Result<()> {
        let radio = Arc::clone(&self.radio);
        let step = self.options.step_timeout;

        self.set_state(ConnectionState::DiscoveringServices);
        let services = with_retry(&RetryConfig::for_discovery(), "discover_services", || {
            let radio = Arc::clone(&radio);
            async move {
                timeout(step, radio.discover(id))
                    .await
                    .map_err(|_| Error::timeout("discover_services", step))?
            }
        })
        .await?;
        let service = services
            .iter()
            .find(|s| s.uuid == self.profile.service)
            .ok_or(Error::Link(LinkError::GattDiscoveryFailed(self.profile.service)))?;

        self.set_state(ConnectionState::DiscoveringCharacteristics);
        for characteristic in self.profile.notify.iter().chain([&self.profile.write]) {
            if !service.has(*characteristic) {
                return Err(Error::Link(LinkError::GattDiscoveryFailed(*characteristic)));
            }
        }
        for characteristic in self.profile.notify.clone() {
            with_retry(&RetryConfig::for_discovery(), "subscribe", || {
                let radio = Arc::clone(&radio);
                async move {
                    timeout(step, radio.subscribe(id, characteristic))
                        .await
                        .map_err(|_| Error::timeout("subscribe", step))?
                }
            })
            .await?;
            trace!(%characteristic, "subscribed");
        }

        self.set_state(if self.profile.authenticates {
            ConnectionState::Authenticating
        } else {
            ConnectionState::Subscribed
        });
        self.backoff.reset();
        info!("connected");
        self.pending.push_back(LinkEvent::Connected);
        self.dispatcher.send(CgmEvent::Connected {
            device: self.device_id(),
        });
        Ok(())
    }

    async fn fail_connection(&mut self, id: &str, error: &Error) {
        warn!(peripheral = %id, error = %error, "connection setup failed");
        if let Err(e) = self.radio.disconnect(id).await {
            debug!(error = %e, "disconnect after failure");
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    async fn rescan(&mut self, id: &str) {
        if let Err(e) = self.radio.disconnect(id).await {
            debug!(error = %e, "disconnect after stalled connect");
        }
        self.set_state(ConnectionState::Disconnected);
        let target = self
            .target
            .clone()
            .unwrap_or_else(|| self.profile.scan_target())
            .with_identity(id);
        match self.radio.start_scan(&target.scan_services()).await {
            Ok(()) => {
                self.target = Some(target);
                self.set_state(ConnectionState::Scanning);
            }
            Err(e) => {
                warn!(error = %e, "rescan failed");
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.peripheral.is_none() {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!(?delay, attempt = self.backoff.attempts(), "reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
                self.dispatcher.send(CgmEvent::ReconnectStarted {
                    device: self.device_id(),
                    attempt: self.backoff.attempts(),
                });
            }
            None => {
                warn!(attempts = self.backoff.attempts(), "reconnect attempts exhausted");
                self.auto_reconnect = false;
                self.reconnect_at = None;
            }
        }
    }

    async fn reconnect_now(&mut self) {
        let Some(id) = self.peripheral.clone() else {
            return;
        };
        if !self.auto_reconnect || self.state != ConnectionState::Disconnected {
            return;
        }
        if self.is_rejected(&id).is_some() {
            return;
        }
        debug!(peripheral = %id, "reconnecting");
        // failures reschedule themselves
        if let Err(e) = self.attempt(&id).await {
            debug!(error = %e, "reconnect attempt failed");
        }
    }

    /// Wait for the next link event.
    ///
    /// Discovery, reconnection and watchdog handling happen inside this
    /// call. Notifications are returned in radio order.
    pub async fn next_event(&mut self) -> LinkEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let reconnect_at = self.reconnect_at;
            let received = tokio::select! {
                received = self.events_rx.recv() => Some(received),
                () = until(reconnect_at) => None,
            };
            match received {
                None => {
                    self.reconnect_at = None;
                    self.reconnect_now().await;
                }
                Some(Ok(event)) => self.handle_radio_event(event).await,
                Some(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "radio events dropped");
                }
                Some(Err(RecvError::Closed)) => {
                    self.set_state(ConnectionState::Disconnected);
                    return LinkEvent::AdapterUnavailable;
                }
            }
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered(adv) => self.on_discovered(adv).await,
            RadioEvent::Disconnected(id) => {
                if self.peripheral.as_deref() != Some(id.as_str()) || !self.state.is_link_up() {
                    return;
                }
                info!(peripheral = %id, "link lost");
                self.set_state(ConnectionState::Disconnected);
                self.pending.push_back(LinkEvent::Disconnected {
                    will_reconnect: self.auto_reconnect,
                });
                self.dispatcher.send(CgmEvent::Disconnected {
                    device: self.device_id(),
                    will_reconnect: self.auto_reconnect,
                });
                self.schedule_reconnect();
            }
            RadioEvent::Notification {
                id,
                characteristic,
                value,
            } => {
                if self.peripheral.as_deref() != Some(id.as_str()) || !self.state.is_ready() {
                    trace!(peripheral = %id, "notification outside session dropped");
                    return;
                }
                if self.state == ConnectionState::Subscribed {
                    self.set_state(ConnectionState::Streaming);
                }
                self.pending.push_back(LinkEvent::Value {
                    characteristic,
                    bytes: value,
                });
            }
            RadioEvent::AdapterStateChanged(AdapterState::PoweredOff) => {
                warn!("adapter powered off");
                self.reconnect_at = None;
                if self.state.is_link_up() {
                    self.pending.push_back(LinkEvent::Disconnected {
                        will_reconnect: self.auto_reconnect,
                    });
                }
                self.set_state(ConnectionState::Disconnected);
                self.pending.push_back(LinkEvent::AdapterUnavailable);
            }
            RadioEvent::AdapterStateChanged(AdapterState::PoweredOn) => {
                info!("adapter powered on");
                if self.state == ConnectionState::Disconnected
                    && self.auto_reconnect
                    && self.peripheral.is_some()
                {
                    self.reconnect_at = Some(Instant::now());
                }
            }
            RadioEvent::AdapterStateChanged(AdapterState::Unknown) => {}
        }
    }

    async fn on_discovered(&mut self, adv: Advertisement) {
        match self.state {
            ConnectionState::Scanning => {
                let matched = self.target.as_ref().is_some_and(|t| t.matches(&adv));
                if !matched {
                    return;
                }
                if let Some(remaining) = self.is_rejected(&adv.id) {
                    debug!(peripheral = %adv.id, ?remaining, "skipping rejected transmitter");
                    return;
                }
                info!(peripheral = %adv.id, name = ?adv.name, rssi = ?adv.rssi, "transmitter found");
                if let Err(e) = self.radio.stop_scan().await {
                    debug!(error = %e, "stop_scan failed");
                }
                self.peripheral = Some(adv.id.clone());
                self.peripheral_name = adv.name.clone();
                self.dispatcher.send(CgmEvent::Discovered {
                    device: self.device_id(),
                    rssi: adv.rssi,
                });
                if let Err(e) = self.attempt(&adv.id).await {
                    debug!(error = %e, "connect after discovery failed");
                }
            }
            ConnectionState::Disconnected
                if self.auto_reconnect && self.peripheral.as_deref() == Some(adv.id.as_str()) =>
            {
                if self.is_rejected(&adv.id).is_some() {
                    return;
                }
                self.reconnect_at = None;
                if let Err(e) = self.attempt(&adv.id).await {
                    debug!(error = %e, "connect on re-advertisement failed");
                }
            }
            _ => {}
        }
    }

    /// Tear down the connection.
    ///
    /// With `reconnect` the known identity is reconnected after the backoff
    /// delay; without it nothing happens until the next
    /// [`start_scanning`](Self::start_scanning) or [`connect`](Self::connect).
    pub async fn disconnect(&mut self, reconnect: bool) {
        self.reconnect_at = None;
        self.auto_reconnect = reconnect;
        // nothing from the old connection may reach the next one
        self.pending.clear();
        if self.state == ConnectionState::Scanning
            && let Err(e) = self.radio.stop_scan().await
        {
            debug!(error = %e, "stop_scan failed");
        }
        if self.state.is_link_up()
            && let Some(id) = self.peripheral.clone()
            && let Err(e) = self.radio.disconnect(&id).await
        {
            debug!(peripheral = %id, error = %e, "disconnect failed");
        }
        info!(reconnect, "disconnected");
        self.set_state(ConnectionState::Disconnected);
        if reconnect {
            self.schedule_reconnect();
        }
    }

    /// Write to a characteristic of the connected transmitter.
    ///
    /// With `require_ack` the call returns only after the link-layer write
    /// confirmation. Writes are never repeated here: a lost confirmation
    /// does not mean the transmitter missed the command, so the caller
    /// decides whether to send it again.
    ///
    /// # Errors
    ///
    /// [`LinkError::Disconnected`] when no session is ready, otherwise the
    /// write error or a timeout.
    pub async fn write(&mut self, bytes: &[u8], characteristic: Uuid, require_ack: bool) -> Result<()> {
        let Some(id) = self.peripheral.clone() else {
            return Err(Error::Link(LinkError::Disconnected));
        };
        if !self.state.is_ready() {
            return Err(Error::Link(LinkError::Disconnected));
        }
        trace!(%characteristic, bytes = %hex(bytes), require_ack, "write");
        let step = self.options.step_timeout;
        let kind = WriteKind::for_ack(require_ack);
        timeout(step, self.radio.write(&id, characteristic, bytes, kind))
            .await
            .map_err(|_| Error::timeout("write", step))?
    }

    /// Refuse `id` for `cooldown` and look for another transmitter.
    ///
    /// # Errors
    ///
    /// Errors from restarting the scan.
    pub async fn reject(&mut self, id: &str, cooldown: Duration) -> Result<()> {
        warn!(peripheral = %id, ?cooldown, "rejecting transmitter");
        self.rejected.insert(id.to_string(), Instant::now() + cooldown);
        if self.peripheral.as_deref() == Some(id) {
            self.disconnect(false).await;
            self.peripheral = None;
            self.peripheral_name = None;
            self.backoff.reset();
        }
        let mut target = self
            .target
            .clone()
            .unwrap_or_else(|| self.profile.scan_target());
        target.identity = None;
        self.start_scanning(target).await
    }

    /// Time left on `id`'s rejection, if any.
    pub fn is_rejected(&mut self, id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.rejected.retain(|_, until| *until > now);
        self.rejected.get(id).map(|until| *until - now)
    }

    /// The transmitter accepted this host.
    pub fn mark_authenticated(&mut self) {
        if self.state == ConnectionState::Authenticating {
            self.set_state(ConnectionState::Subscribed);
        }
    }

    /// Clean up after a [`next_event`](Self::next_event) future was dropped
    /// halfway through connection setup.
    pub async fn recover_interrupted(&mut self) {
        if !self.state.is_connecting() {
            return;
        }
        warn!(state = %self.state, "connection setup interrupted");
        if let Some(id) = self.peripheral.clone()
            && let Err(e) = self.radio.disconnect(&id).await
        {
            debug!(error = %e, "disconnect after interruption");
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
