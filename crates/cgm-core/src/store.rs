//! Where accepted readings go, and who hears about sensor conditions.
//!
//! The coordinator hands every reconciled batch to a [`GlucoseStore`] and
//! asks it for the newest stored timestamp when it meets a sensor for the
//! first time, so that a restart does not re-deliver history. Sensor and
//! transmitter conditions are forwarded to an [`AlertSink`].

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use cgm_types::{GlucoseSample, SensorError};

use crate::error::Result;

/// Persistence for accepted readings, keyed by sensor.
#[async_trait]
pub trait GlucoseStore: Send + Sync {
    /// Persist `samples` (oldest first, already reconciled).
    async fn store_new_readings(&self, sensor_id: &str, samples: &[GlucoseSample]) -> Result<()>;

    /// Timestamp of the newest stored reading of `sensor_id`.
    async fn latest_stored_timestamp(&self, sensor_id: &str) -> Result<Option<OffsetDateTime>>;
}

/// Receiver of user-facing conditions.
///
/// Every method defaults to doing nothing.
pub trait AlertSink: Send + Sync {
    /// A different sensor was attached.
    fn new_sensor(&self, _serial: Option<&str>) {}

    /// Transmitter battery level in percent.
    fn battery_level(&self, _percent: u8) {}

    /// Sensor age in minutes.
    fn sensor_age(&self, _minutes: u32) {}

    /// The sensor reported a problem.
    fn sensor_error(&self, _error: &SensorError) {}

    /// Transmitter firmware and hardware revision.
    fn transmitter_info(&self, _firmware: &str, _hardware: &str) {}
}

/// An [`AlertSink`] that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAlerts;

impl AlertSink for NoopAlerts {}

/// [`GlucoseStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<HashMap<String, Vec<GlucoseSample>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored for `sensor_id`, in insertion order.
    pub async fn samples(&self, sensor_id: &str) -> Vec<GlucoseSample> {
        self.readings
            .read()
            .await
            .get(sensor_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of readings across all sensors.
    pub async fn len(&self) -> usize {
        self.readings.read().await.values().map(Vec::len).sum()
    }

    /// Whether nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl GlucoseStore for MemoryStore {
    async fn store_new_readings(&self, sensor_id: &str, samples: &[GlucoseSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.readings
            .write()
            .await
            .entry(sensor_id.to_string())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    async fn latest_stored_timestamp(&self, sensor_id: &str) -> Result<Option<OffsetDateTime>> {
        Ok(self
            .readings
            .read()
            .await
            .get(sensor_id)
            .and_then(|samples| samples.iter().map(|s| s.timestamp).max()))
    }
}
