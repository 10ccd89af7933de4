//! BLE link management and data pipeline for continuous glucose monitors.
//!
//! This crate connects to CGM transmitters over Bluetooth Low Energy, runs
//! each vendor's protocol, and turns what the sensor sends into a clean,
//! deduplicated stream of glucose samples.
//!
//! # Features
//!
//! - **Link management**: scan, connect, discover and subscribe with per-step
//!   timeouts, a connecting watchdog and reconnection with backoff
//! - **Vendor sessions**: Blucon, MiaoMiao, Bubble and Atom bridges for
//!   Libre 1 sensors, Dexcom G5/G6 with challenge authentication and
//!   bonding, Dexcom G7 with authentication checks, backfill for both
//! - **Reconciliation**: replay filtering against a per-sensor watermark,
//!   sorting and minimum-spacing coalescing
//! - **Testable timing**: protocol timers run on an injectable clock
//! - **Mock radio**: scripted peripherals for tests without hardware
//!
//! # Supported Transmitters
//!
//! | Transmitter | Sensor | Link |
//! |-------------|--------|------|
//! | Blucon | Libre 1 | Polled, disconnects after each reading |
//! | MiaoMiao | Libre 1 | Stays connected, pushes a packet every 5 minutes |
//! | Bubble / Atom | Libre 1 | Stays connected, streams the sensor image every 5 minutes |
//! | Dexcom G5 / G6 | built in | Authenticates, reads, disconnects after each reading |
//! | Dexcom G7 / Stelo | built in | Stays connected until the transmitter hangs up |
//!
//! # Platform Differences
//!
//! Peripheral identities come from the radio backend. On macOS they are
//! CoreBluetooth UUIDs, stable per host but not across machines. On Linux
//! and Windows they are MAC addresses.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cgm_core::{
//!     BtleplugRadio, EventDispatcher, MemoryStore, NoopAlerts, SystemClock,
//!     TransmitterConfig, TransmitterCoordinator, session,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransmitterConfig::blucon("BLU12345");
//!     let store = Arc::new(MemoryStore::new());
//!     let mut coordinator = TransmitterCoordinator::new(
//!         Arc::new(BtleplugRadio::new().await?),
//!         session::for_config(&config),
//!         store.clone(),
//!         Arc::new(NoopAlerts),
//!         Arc::new(SystemClock),
//!         config,
//!         EventDispatcher::default(),
//!     )?;
//!
//!     let report = coordinator.poll_cycle().await?;
//!     for sample in &report.accepted {
//!         println!("{} {:.0} mg/dL", sample.timestamp, sample.raw_value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod link;
pub mod mock;
pub mod radio;
pub mod reconcile;
pub mod reconnect;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod util;

// Core exports
pub use config::{ReconnectConfig, TransmitterConfig};
pub use coordinator::{CycleReport, TransmitterCoordinator};
pub use error::{AuthenticationError, Error, LinkError, ProtocolError, Result, SensorError};
pub use link::{BleLinkManager, ConnectionState, LinkEvent, LinkOptions, LinkProfile};
pub use reconcile::{DedupeWatermark, Reconciled, SampleReconciler};
pub use session::{DeviceSession, LinkPolicy};
pub use store::{AlertSink, GlucoseStore, MemoryStore, NoopAlerts};

// Radio and timing
pub use btle::BtleplugRadio;
pub use mock::{MockPeripheral, MockRadio, MockRadioBuilder};
pub use radio::{AdapterState, Advertisement, RadioEvent, RadioStack, ScanTarget, WriteKind};
pub use scheduler::{Clock, Scheduler, SystemClock, TimerKind, VirtualClock};

pub use events::{CgmEvent, DeviceId, EventDispatcher, EventReceiver, EventSender};
pub use reconnect::ReconnectOptions;
pub use retry::{RetryConfig, with_retry};
pub use util::{create_identifier, format_peripheral_id};

// Re-export from cgm-types
pub use cgm_types::uuid as uuids;
pub use cgm_types::{GlucoseSample, SensorState, TransmitterKind};
