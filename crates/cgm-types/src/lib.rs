//! Platform-agnostic types and byte-level decoders for CGM transmitters.
//!
//! This crate holds everything that can be done without a radio: sample
//! types, GATT UUIDs, CRC verification, fragment assembly and the vendor
//! message decoders. It is shared by `cgm-core` and by tooling that only
//! needs to inspect captured traffic.
//!
//! # Features
//!
//! - Libre sensor memory images: CRC gate, ring-buffer walk, serial numbers
//! - Blucon, MiaoMiao, Bubble and Atom bridge messages
//! - Dexcom G5/G6/G7 messages, the G5/G6 authentication challenge and backfill
//! - A total [`frame::decode_opcode`] dispatcher
//!
//! # Example
//!
//! ```
//! use cgm_types::{DecodedFrame, TransmitterKind, decode_opcode};
//!
//! let frame = decode_opcode(TransmitterKind::Blucon, &[0xcb, 0x02, 0x00, 0x00]);
//! assert!(matches!(frame, DecodedFrame::BatteryStatus(_)));
//! ```

pub mod blucon;
pub mod bubble;
pub mod crc;
pub mod dexcom;
pub mod error;
pub mod frame;
pub mod libre;
pub mod miaomiao;
pub mod serial;
pub mod snapshot;
pub mod types;
pub mod uuid;

pub use crc::{CrcLayout, verify_crc16};
pub use dexcom::{DexcomAlgorithmState, DexcomGlucose};
pub use error::{ProtocolError, Result, SensorError};
pub use frame::{BatteryStatus, DecodedFrame, DeviceFault, SensorStatus, decode_on, decode_opcode};
pub use libre::{GlucoseRing, RingOptions, parse_glucose_ring};
pub use snapshot::{SensorMemorySnapshot, SnapshotStatus};
pub use types::{
    DEDUPE_TOLERANCE, DEFAULT_SAMPLE_SPACING, GLUCOSE_MAX_MG_DL, GLUCOSE_MIN_MG_DL, GlucoseSample,
    LibreFamily, SensorState, TransmitterKind,
};
pub use self::uuid as uuids;
