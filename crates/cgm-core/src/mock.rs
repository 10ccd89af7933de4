//! In-memory radio for testing.
//!
//! [`MockRadio`] implements [`RadioStack`] without hardware. Peripherals are
//! scripted with [`MockPeripheral`]; a per-peripheral responder turns
//! writes into notifications, which is enough to play back a whole vendor
//! exchange.
//!
//! # Features
//!
//! - **Failure injection**: fail the next N connects or writes, or hang connects
//! - **Write log**: every write is recorded for assertions
//! - **Link control**: drop links and power-cycle the adapter from the test
//!
//! # Example
//!
//! ```
//! use cgm_core::{MockPeripheral, MockRadio, RadioStack};
//!
//! # async fn example() -> cgm_core::Result<()> {
//! let radio = MockRadio::builder()
//!     .peripheral(MockPeripheral::blucon("AA:00:00:00:00:01", "BLU0001234"))
//!     .build();
//! radio.connect("AA:00:00:00:00:01").await?;
//! assert!(radio.is_connected("AA:00:00:00:00:01").await);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use cgm_types::uuids;

use crate::error::{Error, LinkError, Result};
use crate::radio::{AdapterState, Advertisement, DiscoveredService, RadioEvent, RadioStack, WriteKind};

/// Produces notifications `(characteristic, value)` in answer to a write.
pub type Responder = Box<dyn FnMut(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send>;

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub id: String,
    pub name: Option<String>,
    /// Services put in the advertisement.
    pub advertised: Vec<Uuid>,
    pub rssi: Option<i16>,
    /// GATT table returned by discovery.
    pub services: Vec<DiscoveredService>,
}

impl MockPeripheral {
    /// A peripheral with no services.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            advertised: Vec::new(),
            rssi: Some(-60),
            services: Vec::new(),
        }
    }

    /// Add a GATT service.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push(DiscoveredService {
            uuid,
            characteristics: characteristics.to_vec(),
        });
        self
    }

    /// Advertise a service UUID.
    #[must_use]
    pub fn advertising(mut self, uuid: Uuid) -> Self {
        self.advertised.push(uuid);
        self
    }

    /// Blucon GATT layout.
    pub fn blucon(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name).with_service(
            uuids::BLUCON_SERVICE,
            &[uuids::BLUCON_RECEIVE, uuids::BLUCON_WRITE],
        )
    }

    /// MiaoMiao GATT layout.
    pub fn miaomiao(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name)
            .advertising(uuids::MIAOMIAO_SERVICE)
            .with_service(
                uuids::MIAOMIAO_SERVICE,
                &[uuids::MIAOMIAO_RECEIVE, uuids::MIAOMIAO_WRITE],
            )
    }

    /// Bubble and Atom GATT layout.
    pub fn bubble(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name).with_service(
            uuids::BUBBLE_SERVICE,
            &[uuids::BUBBLE_RECEIVE, uuids::BUBBLE_WRITE],
        )
    }

    /// Dexcom G7 GATT layout; the G5 and G6 share it.
    pub fn dexcom_g7(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name)
            .advertising(uuids::DEXCOM_ADVERTISEMENT)
            .with_service(
                uuids::DEXCOM_SERVICE,
                &[
                    uuids::DEXCOM_COMMUNICATION,
                    uuids::DEXCOM_CONTROL,
                    uuids::DEXCOM_AUTHENTICATION,
                    uuids::DEXCOM_BACKFILL,
                ],
            )
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: self.name.clone(),
            services: self.advertised.clone(),
            rssi: self.rssi,
        }
    }
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub id: String,
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
    pub kind: WriteKind,
}

#[derive(Default)]
struct MockState {
    peripherals: HashMap<String, MockPeripheral>,
    connected: HashSet<String>,
    subscribed: HashSet<(String, Uuid)>,
    scan_filter: Option<Vec<Uuid>>,
    writes: Vec<WriteRecord>,
    responders: HashMap<String, Responder>,
}

/// In-memory [`RadioStack`].
pub struct MockRadio {
    state: Mutex<MockState>,
    adapter: Mutex<AdapterState>,
    events: broadcast::Sender<RadioEvent>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    failing_writes: AtomicU32,
    hang_connects: AtomicBool,
}

impl std::fmt::Debug for MockRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRadio")
            .field("connect_attempts", &self.connect_attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        MockRadioBuilder::new().build()
    }
}

impl MockRadio {
    /// Start building a radio.
    pub fn builder() -> MockRadioBuilder {
        MockRadioBuilder::new()
    }

    /// Add a peripheral; it is advertised right away if a matching scan runs.
    pub async fn add_peripheral(&self, peripheral: MockPeripheral) {
        let adv = peripheral.advertisement();
        let scanning = {
            let mut state = self.state.lock().await;
            state.peripherals.insert(peripheral.id.clone(), peripheral);
            state.scan_filter.clone()
        };
        if let Some(filter) = scanning
            && passes(&filter, &adv)
        {
            self.emit(RadioEvent::Discovered(adv));
        }
    }

    /// Install the function answering writes to `id`.
    pub async fn on_write<F>(&self, id: &str, responder: F)
    where
        F: FnMut(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + 'static,
    {
        self.state
            .lock()
            .await
            .responders
            .insert(id.to_string(), Box::new(responder));
    }

    /// Deliver a notification as if the peripheral sent it.
    ///
    /// Dropped unless the peripheral is connected and the characteristic
    /// subscribed.
    pub async fn notify(&self, id: &str, characteristic: Uuid, value: impl Into<Vec<u8>>) -> bool {
        let deliverable = {
            let state = self.state.lock().await;
            state.connected.contains(id) && state.subscribed.contains(&(id.to_string(), characteristic))
        };
        if deliverable {
            self.emit(RadioEvent::Notification {
                id: id.to_string(),
                characteristic,
                value: value.into(),
            });
        }
        deliverable
    }

    /// Drop the link from the peripheral side.
    pub async fn drop_link(&self, id: &str) {
        let was_connected = {
            let mut state = self.state.lock().await;
            state.subscribed.retain(|(p, _)| p != id);
            state.connected.remove(id)
        };
        if was_connected {
            self.emit(RadioEvent::Disconnected(id.to_string()));
        }
    }

    /// Re-send the advertisement of a known peripheral.
    pub async fn advertise(&self, id: &str) {
        let adv = self.state.lock().await.peripherals.get(id).map(MockPeripheral::advertisement);
        if let Some(adv) = adv {
            self.emit(RadioEvent::Discovered(adv));
        }
    }

    /// Switch the adapter on or off. Powering off drops every link.
    pub async fn set_adapter_state(&self, new_state: AdapterState) {
        *self.adapter.lock().await = new_state;
        if new_state == AdapterState::PoweredOff {
            let dropped: Vec<String> = {
                let mut state = self.state.lock().await;
                state.subscribed.clear();
                state.scan_filter = None;
                state.connected.drain().collect()
            };
            for id in dropped {
                self.emit(RadioEvent::Disconnected(id));
            }
        }
        self.emit(RadioEvent::AdapterStateChanged(new_state));
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make connection attempts never complete.
    pub fn set_hang_connects(&self, hang: bool) {
        self.hang_connects.store(hang, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// All writes so far.
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().await.writes.clone()
    }

    /// Payloads written to one characteristic.
    pub async fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .writes
            .iter()
            .filter(|w| w.characteristic == characteristic)
            .map(|w| w.bytes.clone())
            .collect()
    }

    /// Forget recorded writes.
    pub async fn clear_writes(&self) {
        self.state.lock().await.writes.clear();
    }

    /// Whether `id` is connected.
    pub async fn is_connected(&self, id: &str) -> bool {
        self.state.lock().await.connected.contains(id)
    }

    /// Whether a scan is running.
    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scan_filter.is_some()
    }

    fn emit(&self, event: RadioEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn ensure_powered(&self) -> Result<()> {
        if self.adapter.lock().await.is_usable() {
            Ok(())
        } else {
            Err(Error::Link(LinkError::BluetoothUnavailable))
        }
    }
}

fn passes(filter: &[Uuid], adv: &Advertisement) -> bool {
    filter.is_empty() || filter.iter().any(|s| adv.services.contains(s))
}

#[async_trait]
impl RadioStack for MockRadio {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(*self.adapter.lock().await)
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.ensure_powered().await?;
        let visible: Vec<Advertisement> = {
            let mut state = self.state.lock().await;
            state.scan_filter = Some(services.to_vec());
            state
                .peripherals
                .values()
                .filter(|p| !state.connected.contains(&p.id))
                .map(MockPeripheral::advertisement)
                .filter(|adv| passes(services, adv))
                .collect()
        };
        for adv in visible {
            self.emit(RadioEvent::Discovered(adv));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().await.scan_filter = None;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_powered().await?;
        if !self.state.lock().await.peripherals.contains_key(id) {
            return Err(Error::Link(LinkError::NotFound(id.to_string())));
        }
        if self.hang_connects.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if Self::take_failure(&self.failing_connects) {
            return Err(Error::Link(LinkError::ConnectTimeout(id.to_string())));
        }
        self.state.lock().await.connected.insert(id.to_string());
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.subscribed.retain(|(p, _)| p != id);
        state.connected.remove(id);
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<Vec<DiscoveredService>> {
        let state = self.state.lock().await;
        if !state.connected.contains(id) {
            return Err(Error::Link(LinkError::Disconnected));
        }
        Ok(state
            .peripherals
            .get(id)
            .map(|p| p.services.clone())
            .unwrap_or_default())
    }

    async fn subscribe(&self, id: &str, characteristic: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected.contains(id) {
            return Err(Error::Link(LinkError::Disconnected));
        }
        let known = state
            .peripherals
            .get(id)
            .is_some_and(|p| p.services.iter().any(|s| s.has(characteristic)));
        if !known {
            return Err(Error::Link(LinkError::GattDiscoveryFailed(characteristic)));
        }
        state.subscribed.insert((id.to_string(), characteristic));
        Ok(())
    }

    async fn write(&self, id: &str, characteristic: Uuid, bytes: &[u8], kind: WriteKind) -> Result<()> {
        if Self::take_failure(&self.failing_writes) {
            return Err(Error::write_failed(characteristic, "injected failure"));
        }
        let replies = {
            let mut state = self.state.lock().await;
            if !state.connected.contains(id) {
                return Err(Error::Link(LinkError::Disconnected));
            }
            state.writes.push(WriteRecord {
                id: id.to_string(),
                characteristic,
                bytes: bytes.to_vec(),
                kind,
            });
            match state.responders.get_mut(id) {
                Some(responder) => responder(characteristic, bytes),
                None => Vec::new(),
            }
        };
        for (reply_on, value) in replies {
            self.notify(id, reply_on, value).await;
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

/// Builder for [`MockRadio`].
pub struct MockRadioBuilder {
    peripherals: Vec<MockPeripheral>,
    adapter: AdapterState,
    capacity: usize,
}

impl Default for MockRadioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadioBuilder {
    /// Powered-on adapter, no peripherals.
    pub fn new() -> Self {
        Self {
            peripherals: Vec::new(),
            adapter: AdapterState::PoweredOn,
            capacity: 1024,
        }
    }

    /// Add a peripheral.
    #[must_use]
    pub fn peripheral(mut self, peripheral: MockPeripheral) -> Self {
        self.peripherals.push(peripheral);
        self
    }

    /// Initial adapter state.
    #[must_use]
    pub fn adapter_state(mut self, state: AdapterState) -> Self {
        self.adapter = state;
        self
    }

    /// Event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Build the radio.
    pub fn build(self) -> MockRadio {
        let (events, _) = broadcast::channel(self.capacity);
        let state = MockState {
            peripherals: self.peripherals.into_iter().map(|p| (p.id.clone(), p)).collect(),
            ..Default::default()
        };
        MockRadio {
            state: Mutex::new(state),
            adapter: Mutex::new(self.adapter),
            events,
            connect_attempts: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            hang_connects: AtomicBool::new(false),
        }
    }
}
