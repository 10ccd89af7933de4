//! Radio stack abstraction.
//!
//! [`RadioStack`] is the only OS boundary of the crate: scan, connect,
//! discover, subscribe, write and disconnect, plus a broadcast stream of
//! [`RadioEvent`]s. [`crate::BtleplugRadio`] implements it over btleplug and
//! [`crate::MockRadio`] in memory for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::util::name_matches;

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

impl AdapterState {
    /// Whether scanning and connecting are possible.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        // Unknown is what most backends report until the first state update.
        !matches!(self, AdapterState::PoweredOff)
    }
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral identifier.
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// What the link manager is looking for while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanTarget {
    /// Case-insensitive substring of the advertised name.
    pub name: Option<String>,
    /// Advertised service UUID.
    pub service: Option<Uuid>,
    /// A previously connected identity; matches regardless of name.
    pub identity: Option<String>,
}

impl ScanTarget {
    /// Match by name substring.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Match by advertised service.
    pub fn service(service: Uuid) -> Self {
        Self {
            service: Some(service),
            ..Default::default()
        }
    }

    /// Also match by advertised service.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    /// Also match a known identity.
    #[must_use]
    pub fn with_identity(mut self, id: impl Into<String>) -> Self {
        self.identity = Some(id.into());
        self
    }

    /// Whether an advertisement satisfies this target.
    ///
    /// A known identity always matches. Otherwise every configured
    /// criterion must hold; a target with no criteria matches nothing.
    #[must_use]
    pub fn matches(&self, adv: &Advertisement) -> bool {
        if self.identity.as_deref() == Some(adv.id.as_str()) {
            return true;
        }
        if self.name.is_none() && self.service.is_none() {
            return false;
        }
        let name_ok = match &self.name {
            Some(pattern) => adv.name.as_deref().is_some_and(|n| name_matches(n, pattern)),
            None => true,
        };
        let service_ok = match self.service {
            Some(service) => adv.services.contains(&service),
            None => true,
        };
        name_ok && service_ok
    }

    /// Services to pass to the backend scan filter.
    #[must_use]
    pub fn scan_services(&self) -> Vec<Uuid> {
        self.service.into_iter().collect()
    }
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    /// Whether `characteristic` belongs to this service.
    #[must_use]
    pub fn has(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains(&characteristic)
    }
}

/// GATT write type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Wait for the link-layer confirmation.
    WithResponse,
    /// Fire and forget.
    WithoutResponse,
}

impl WriteKind {
    /// Write type for a request that does or does not need an acknowledgement.
    #[must_use]
    pub fn for_ack(require_ack: bool) -> Self {
        if require_ack {
            WriteKind::WithResponse
        } else {
            WriteKind::WithoutResponse
        }
    }
}

/// Asynchronous radio callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement was received during a scan.
    Discovered(Advertisement),
    /// A peripheral dropped its link.
    Disconnected(String),
    /// A subscribed characteristic changed.
    Notification {
        id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The adapter was switched on or off.
    AdapterStateChanged(AdapterState),
}

/// A BLE central-role radio.
///
/// Implementations deliver notifications for one peripheral in arrival
/// order through [`RadioStack::events`].
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Current adapter power state.
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Start a scan, optionally filtered by advertised services.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Stop a running scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to a peripheral seen earlier.
    async fn connect(&self, id: &str) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self, id: &str) -> Result<()>;

    /// Discover services and characteristics.
    async fn discover(&self, id: &str) -> Result<Vec<DiscoveredService>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, id: &str, characteristic: Uuid) -> Result<()>;

    /// Write to a characteristic.
    async fn write(&self, id: &str, characteristic: Uuid, bytes: &[u8], kind: WriteKind) -> Result<()>;

    /// Subscribe to radio events.
    fn events(&self) -> broadcast::Receiver<RadioEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgm_types::uuids::{BLUCON_SERVICE, DEXCOM_ADVERTISEMENT};

    fn adv(name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            id: "AA:BB:CC:DD:EE:FF".into(),
            name: name.map(String::from),
            services,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_name_match_is_case_insensitive_substring() {
        let target = ScanTarget::name("blu");
        assert!(target.matches(&adv(Some("BLU00123"), vec![])));
        assert!(target.matches(&adv(Some("myblucon"), vec![])));
        assert!(!target.matches(&adv(Some("miaomiao"), vec![])));
        assert!(!target.matches(&adv(None, vec![])));
    }

    #[test]
    fn test_service_and_name_both_required() {
        let target = ScanTarget::name("DX").with_service(DEXCOM_ADVERTISEMENT);
        assert!(target.matches(&adv(Some("DX02AB"), vec![DEXCOM_ADVERTISEMENT])));
        assert!(!target.matches(&adv(Some("DX02AB"), vec![BLUCON_SERVICE])));
        assert!(!target.matches(&adv(Some("other"), vec![DEXCOM_ADVERTISEMENT])));
    }

    #[test]
    fn test_identity_matches_without_name() {
        let target = ScanTarget::name("BLU").with_identity("AA:BB:CC:DD:EE:FF");
        assert!(target.matches(&adv(None, vec![])));
    }

    #[test]
    fn test_empty_target_matches_nothing() {
        assert!(!ScanTarget::default().matches(&adv(Some("BLU1"), vec![])));
        assert!(ScanTarget::default().scan_services().is_empty());
    }

    #[test]
    fn test_write_kind_for_ack() {
        assert_eq!(WriteKind::for_ack(true), WriteKind::WithResponse);
        assert_eq!(WriteKind::for_ack(false), WriteKind::WithoutResponse);
    }

    #[test]
    fn test_powered_off_is_not_usable() {
        assert!(AdapterState::PoweredOn.is_usable());
        assert!(AdapterState::Unknown.is_usable());
        assert!(!AdapterState::PoweredOff.is_usable());
    }
}
