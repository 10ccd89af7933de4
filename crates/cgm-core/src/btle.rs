//! [`RadioStack`] over btleplug.
//!
//! One background task forwards the adapter's central events; one task
//! per connected peripheral forwards its notifications. Both feed the same
//! broadcast channel so the link manager sees a single ordered stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, LinkError, Result};
use crate::radio::{AdapterState, Advertisement, DiscoveredService, RadioEvent, RadioStack, WriteKind};
use crate::util::{create_identifier, format_peripheral_id};

const EVENT_CAPACITY: usize = 256;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(Error::Link(LinkError::BluetoothUnavailable))
}

impl From<CentralState> for AdapterState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => AdapterState::PoweredOn,
            CentralState::PoweredOff => AdapterState::PoweredOff,
            _ => AdapterState::Unknown,
        }
    }
}

impl From<WriteKind> for WriteType {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;

/// btleplug-backed radio using the first adapter.
pub struct BtleplugRadio {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    peripherals: PeripheralMap,
    notification_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio").finish_non_exhaustive()
    }
}

impl BtleplugRadio {
    /// Open the first adapter.
    pub async fn new() -> Result<Self> {
        Self::with_adapter(get_adapter().await?).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let peripherals: PeripheralMap = Arc::default();
        let stream = adapter.events().await?;
        let pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            stream,
            events.clone(),
            Arc::clone(&peripherals),
        ));
        Ok(Self {
            adapter,
            events,
            peripherals,
            notification_tasks: Mutex::new(HashMap::new()),
            pump,
        })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().await.get(id) {
            return Ok(p.clone());
        }
        // Not seen during this process' scans; the adapter may still know it.
        for p in self.adapter.peripherals().await? {
            let adv = advertisement(&p).await;
            if adv.id == id {
                self.peripherals.write().await.insert(adv.id, p.clone());
                return Ok(p);
            }
        }
        Err(Error::Link(LinkError::NotFound(id.to_string())))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::Link(LinkError::GattDiscoveryFailed(uuid)))
    }

    async fn stop_notifications(&self, id: &str) {
        if let Some(task) = self.notification_tasks.lock().await.remove(id) {
            task.abort();
        }
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
        if let Ok(mut tasks) = self.notification_tasks.try_lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

async fn advertisement(peripheral: &Peripheral) -> Advertisement {
    let id = peripheral.id();
    match peripheral.properties().await {
        Ok(Some(props)) => Advertisement {
            id: create_identifier(&props.address.to_string(), &id),
            name: props.local_name,
            services: props.services,
            rssi: props.rssi,
        },
        _ => Advertisement {
            id: format_peripheral_id(&id),
            name: None,
            services: Vec::new(),
            rssi: None,
        },
    }
}

async fn identity_of(peripherals: &PeripheralMap, id: &PeripheralId) -> Option<String> {
    peripherals
        .read()
        .await
        .iter()
        .find(|(_, p)| p.id() == *id)
        .map(|(key, _)| key.clone())
}

async fn pump_central_events(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: broadcast::Sender<RadioEvent>,
    peripherals: PeripheralMap,
) {
    while let Some(event) = stream.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let adv = advertisement(&peripheral).await;
                peripherals.write().await.insert(adv.id.clone(), peripheral);
                RadioEvent::Discovered(adv)
            }
            CentralEvent::DeviceDisconnected(id) => match identity_of(&peripherals, &id).await {
                Some(identity) => RadioEvent::Disconnected(identity),
                None => continue,
            },
            CentralEvent::StateUpdate(state) => RadioEvent::AdapterStateChanged(state.into()),
            _ => continue,
        };
        // no subscribers is fine
        let _ = events.send(forwarded);
    }
    debug!("central event stream ended");
}

#[async_trait]
impl RadioStack for BtleplugRadio {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.adapter.adapter_state().await?.into())
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %id))]
    async fn connect(&self, id: &str) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.connect().await?;
        info!("connected");

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let identity = id.to_string();
        let task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let _ = events.send(RadioEvent::Notification {
                    id: identity.clone(),
                    characteristic: n.uuid,
                    value: n.value,
                });
            }
        });
        if let Some(previous) = self.notification_tasks.lock().await.insert(id.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %id))]
    async fn disconnect(&self, id: &str) -> Result<()> {
        self.stop_notifications(id).await;
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<Vec<DiscoveredService>> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        let services: Vec<DiscoveredService> = peripheral
            .services()
            .into_iter()
            .map(|s| DiscoveredService {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect();
        debug!(peripheral = %id, count = services.len(), "services discovered");
        Ok(services)
    }

    async fn subscribe(&self, id: &str, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let c = Self::characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&c).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()))]
    async fn write(&self, id: &str, characteristic: Uuid, bytes: &[u8], kind: WriteKind) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let c = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&c, bytes, kind.into())
            .await
            .map_err(|e| {
                warn!(peripheral = %id, %characteristic, error = %e, "write failed");
                Error::write_failed(characteristic, e.to_string())
            })
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_kind_maps_to_btleplug() {
        assert!(matches!(WriteType::from(WriteKind::WithResponse), WriteType::WithResponse));
        assert!(matches!(
            WriteType::from(WriteKind::WithoutResponse),
            WriteType::WithoutResponse
        ));
    }

    #[test]
    fn test_central_state_mapping() {
        assert_eq!(AdapterState::from(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(AdapterState::from(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(AdapterState::from(CentralState::Unknown), AdapterState::Unknown);
    }
}
