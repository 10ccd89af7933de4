//! Fixtures shared by the mock-radio test suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use cgm_core::{
    CgmEvent, EventDispatcher, EventReceiver, MemoryStore, MockPeripheral, MockRadio, NoopAlerts,
    TransmitterConfig, TransmitterCoordinator, VirtualClock, session, uuids,
};
use cgm_types::GlucoseSample;
use cgm_types::crc::{CrcLayout, LIBRE1_IMAGE_LEN, repair_image};
use cgm_types::miaomiao::{PACKET_LEN, START_READING};

pub const MIAO: &str = "AA:00:00:00:00:01";
pub const BLU: &str = "AA:00:00:00:00:0B";
pub const G7_A: &str = "AA:00:00:00:00:07";
pub const G7_B: &str = "AA:00:00:00:00:08";
pub const BUB: &str = "AA:00:00:00:00:0C";
pub const G6: &str = "AA:00:00:00:00:06";

pub const SENSOR_UID: [u8; 8] = [0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0];
pub const TREND_CURSOR: usize = 5;

pub fn base() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
}

/// A CRC-valid Libre 1 image of a ready sensor; `trend[k]` is the raw
/// value `k` minutes before the read.
pub fn libre_image(age_minutes: u16, trend: &[u16]) -> Vec<u8> {
    let mut image = vec![0u8; LIBRE1_IMAGE_LEN];
    image[4] = 0x03;
    image[26] = TREND_CURSOR as u8;
    image[316..318].copy_from_slice(&age_minutes.to_le_bytes());
    for (k, raw) in trend.iter().enumerate() {
        let slot = (TREND_CURSOR + 16 - 1 - k) % 16;
        let start = 28 + slot * 6;
        image[start..start + 2].copy_from_slice(&raw.to_le_bytes());
    }
    repair_image(&mut image, 0, CrcLayout::Libre1);
    image
}

pub fn miaomiao_packet(image: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x28, 0x01, 0x6b, 0x00, 0x00];
    packet.extend_from_slice(&SENSOR_UID);
    packet.push(87);
    packet.extend_from_slice(&[0x00, 0x39, 0x00, 0x01]);
    packet.extend_from_slice(image);
    packet.resize(PACKET_LEN, 0x29);
    packet
}

pub fn notifications(characteristic: Uuid, bytes: &[u8], size: usize) -> Vec<(Uuid, Vec<u8>)> {
    bytes
        .chunks(size)
        .map(|chunk| (characteristic, chunk.to_vec()))
        .collect()
}

/// Answer every START_READING with the next queued packet; the last one
/// repeats.
pub fn serve_packets(
    packets: Vec<Vec<u8>>,
) -> impl FnMut(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + 'static {
    let mut queue = VecDeque::from(packets);
    move |characteristic, bytes| {
        if characteristic != uuids::MIAOMIAO_WRITE || bytes != [START_READING].as_slice() {
            return Vec::new();
        }
        let packet = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        packet
            .map(|p| notifications(uuids::MIAOMIAO_RECEIVE, &p, 20))
            .unwrap_or_default()
    }
}

pub async fn wait_until_connected(radio: &MockRadio, id: &str) {
    while !radio.is_connected(id).await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // let the link finish subscribing
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub struct Harness {
    pub radio: Arc<MockRadio>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<VirtualClock>,
    pub events: EventReceiver,
    pub coordinator: TransmitterCoordinator<MockRadio>,
}

impl Harness {
    pub fn new(radio: MockRadio, config: TransmitterConfig) -> Self {
        Self::with_store(radio, config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(radio: MockRadio, config: TransmitterConfig, store: Arc<MemoryStore>) -> Self {
        let radio = Arc::new(radio);
        let clock = VirtualClock::new(base());
        let dispatcher = EventDispatcher::new(4096);
        let events = dispatcher.subscribe();
        let coordinator = TransmitterCoordinator::new(
            Arc::clone(&radio),
            session::for_config(&config),
            store.clone(),
            Arc::new(NoopAlerts),
            clock.clone(),
            config,
            dispatcher,
        )
        .expect("valid config");
        Self {
            radio,
            store,
            clock,
            events,
            coordinator,
        }
    }

    pub fn drain_events(&mut self) -> Vec<CgmEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

pub fn miaomiao_radio() -> MockRadio {
    MockRadio::builder()
        .peripheral(MockPeripheral::miaomiao(MIAO, "miaomiao2"))
        .build()
}

pub fn per_minute_miaomiao() -> TransmitterConfig {
    TransmitterConfig::miaomiao().with_sample_spacing_secs(50)
}

pub fn values(samples: &[GlucoseSample]) -> Vec<f64> {
    samples.iter().map(|s| s.raw_value).collect()
}
