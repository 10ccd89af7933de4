//! Libre 1 sensor memory image parsing.
//!
//! A Libre 1 FRAM image is 344 bytes. The body region holds two ring
//! buffers of 6-byte records:
//!
//! | Offset | Content                                   |
//! |--------|-------------------------------------------|
//! | 4      | sensor state                              |
//! | 26     | trend cursor (next slot to be written)    |
//! | 27     | history cursor (next slot to be written)  |
//! | 28     | 16 trend records, one per minute          |
//! | 124    | 32 history records, one per 15 minutes    |
//! | 316    | sensor age in minutes (u16 LE)            |
//!
//! The first two bytes of each record hold the raw reading in their low
//! 13 bits.

use bytes::Buf;
use time::{Duration, OffsetDateTime};

use crate::crc::LIBRE1_IMAGE_LEN;
use crate::error::{ProtocolError, Result};
use crate::types::{DEDUPE_TOLERANCE, DEFAULT_SAMPLE_SPACING, GlucoseSample, SensorState};

/// Number of trend slots.
pub const TREND_SLOTS: usize = 16;
/// Number of history slots.
pub const HISTORY_SLOTS: usize = 32;
/// Byte offset of the first trend record.
pub const TREND_OFFSET: usize = 28;
/// Byte offset of the first history record.
pub const HISTORY_OFFSET: usize = 124;
/// Size of one ring record.
pub const RECORD_LEN: usize = 6;
/// Sensors younger than this are still warming up and carry no usable data.
pub const WARMUP_MINUTES: u16 = 60;

/// Raw sensor counts per mg/dL for uncalibrated Libre 1 readings.
pub const RAW_PER_MG_DL: f64 = 8.5;

const STATE_OFFSET: usize = 4;
const TREND_CURSOR_OFFSET: usize = 26;
const HISTORY_CURSOR_OFFSET: usize = 27;
const AGE_OFFSET: usize = 316;

/// Convert a 13-bit raw reading to mg/dL.
#[must_use]
pub fn raw_to_mg_dl(raw: u16) -> f64 {
    f64::from(raw & 0x1FFF) / RAW_PER_MG_DL
}

/// Extract the 13-bit raw value from the first two bytes of a record.
#[must_use]
pub fn record_raw(record: &[u8]) -> u16 {
    let mut buf = record;
    if buf.remaining() < 2 {
        return 0;
    }
    buf.get_u16_le() & 0x1FFF
}

/// Parameters for [`parse_glucose_ring`].
#[derive(Debug, Clone, Copy)]
pub struct RingOptions {
    /// Instant the image was read from the sensor.
    pub now: OffsetDateTime,
    /// Newest timestamp already persisted, if any.
    pub known_latest: Option<OffsetDateTime>,
    /// Minimum spacing between emitted samples.
    pub min_spacing: Duration,
    /// Samples not newer than `known_latest + tolerance` end the walk.
    pub tolerance: Duration,
}

impl RingOptions {
    /// Options with the default 5 min − 10 s spacing and no known data.
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now,
            known_latest: None,
            min_spacing: DEFAULT_SAMPLE_SPACING,
            tolerance: DEDUPE_TOLERANCE,
        }
    }

    /// Set the newest already-known timestamp.
    #[must_use]
    pub fn known_latest(mut self, latest: Option<OffsetDateTime>) -> Self {
        self.known_latest = latest;
        self
    }

    /// Set the minimum spacing between emitted samples.
    #[must_use]
    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }
}

/// Decoded glucose content of one sensor memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct GlucoseRing {
    /// State byte of the sensor.
    pub sensor_state: SensorState,
    /// Minutes since sensor activation.
    pub sensor_age_minutes: u16,
    /// Activation instant derived from the read time and the age counter.
    pub sensor_start: OffsetDateTime,
    /// Per-minute samples, newest first.
    pub trend: Vec<GlucoseSample>,
    /// 15-minute samples older than every trend sample, newest first.
    pub history: Vec<GlucoseSample>,
}

impl GlucoseRing {
    /// All samples, newest first.
    pub fn samples(&self) -> impl Iterator<Item = &GlucoseSample> {
        self.trend.iter().chain(self.history.iter())
    }

    /// Total number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trend.len() + self.history.len()
    }

    /// Whether the image yielded no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trend.is_empty() && self.history.is_empty()
    }

    /// Consume into a single newest-first list.
    #[must_use]
    pub fn into_samples(self) -> Vec<GlucoseSample> {
        let mut all = self.trend;
        all.extend(self.history);
        all
    }
}

/// Walk a ring buffer backwards from `cursor`, yielding `(age_index, raw)`.
///
/// `age_index` 0 is the most recently written slot.
fn walk_ring(
    image: &[u8],
    base: usize,
    slots: usize,
    cursor: usize,
) -> impl Iterator<Item = (usize, u16)> + '_ {
    (0..slots).map(move |k| {
        // cursor points at the next slot to be written
        let slot = (cursor % slots + slots - 1 - k) % slots;
        let start = base + slot * RECORD_LEN;
        (k, record_raw(&image[start..start + RECORD_LEN]))
    })
}

/// Instant of the newest history record.
///
/// History is written three minutes after each quarter hour. The cursor can
/// advance before the age counter does, in which case the newest record is
/// one period later than the counter suggests.
fn most_recent_history(now: OffsetDateTime, age_minutes: i64, history_cursor: usize) -> OffsetDateTime {
    let expected_cursor = ((age_minutes - 3) / 15) % HISTORY_SLOTS as i64;
    let delay = (age_minutes - 3) % 15 + 3;
    if expected_cursor == history_cursor as i64 {
        now - Duration::minutes(delay)
    } else {
        now - Duration::minutes(delay - 15)
    }
}

/// Parse the trend and history rings of a Libre 1 memory image.
///
/// The image must already have passed [`crate::crc::verify_crc16`].
///
/// Each trend slot `k` (0 = newest) is stamped
/// `sensor_start + max(0, age - k)` minutes. History slots count back in
/// 15-minute steps from the newest history record and are kept only when
/// older than the oldest trend sample. Zero readings are sensor gaps and
/// are skipped. The walk stops at the first sample that is not newer than
/// `known_latest + tolerance`. Samples closer than `min_spacing` to the
/// previously emitted (newer) sample are dropped.
///
/// Sensors that are not ready, or younger than [`WARMUP_MINUTES`], yield an
/// empty ring carrying only state and age.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFrame`] if the image is shorter than
/// [`LIBRE1_IMAGE_LEN`].
pub fn parse_glucose_ring(image: &[u8], options: &RingOptions) -> Result<GlucoseRing> {
    if image.len() < LIBRE1_IMAGE_LEN {
        return Err(ProtocolError::too_short(
            "Libre memory image",
            LIBRE1_IMAGE_LEN,
            image.len(),
        ));
    }

    let sensor_state = SensorState::from(image[STATE_OFFSET]);
    let trend_cursor = usize::from(image[TREND_CURSOR_OFFSET]);
    let history_cursor = usize::from(image[HISTORY_CURSOR_OFFSET]);
    let sensor_age_minutes = {
        let mut buf = &image[AGE_OFFSET..AGE_OFFSET + 2];
        buf.get_u16_le()
    };
    let age = i64::from(sensor_age_minutes);
    let sensor_start = options.now - Duration::minutes(age);

    let mut ring = GlucoseRing {
        sensor_state,
        sensor_age_minutes,
        sensor_start,
        trend: Vec::new(),
        history: Vec::new(),
    };

    if !sensor_state.has_readings() || sensor_age_minutes < WARMUP_MINUTES {
        return Ok(ring);
    }

    let stop_at = options.known_latest.map(|t| t + options.tolerance);
    let mut walker = RingWalker {
        stop_at,
        min_spacing: options.min_spacing,
        last_emitted: None,
        stopped: false,
    };

    let mut oldest_trend: Option<OffsetDateTime> = None;
    for (k, raw) in walk_ring(image, TREND_OFFSET, TREND_SLOTS, trend_cursor) {
        let minutes = (age - k as i64).max(0);
        let ts = sensor_start + Duration::minutes(minutes);
        oldest_trend = Some(ts);
        if let Some(sample) = walker.offer(ts, raw) {
            ring.trend.push(sample);
        }
        if walker.stopped {
            return Ok(ring);
        }
    }

    let newest_history = most_recent_history(options.now, age, history_cursor);
    let newest_offset = newest_history - sensor_start;
    for (k, raw) in walk_ring(image, HISTORY_OFFSET, HISTORY_SLOTS, history_cursor) {
        let offset = newest_offset - Duration::seconds(900 * k as i64);
        let ts = sensor_start + offset.max(Duration::ZERO);
        if oldest_trend.is_some_and(|oldest| ts >= oldest) {
            continue;
        }
        if let Some(sample) = walker.offer(ts, raw) {
            ring.history.push(sample);
        }
        if walker.stopped {
            break;
        }
    }

    Ok(ring)
}

struct RingWalker {
    stop_at: Option<OffsetDateTime>,
    min_spacing: Duration,
    last_emitted: Option<OffsetDateTime>,
    stopped: bool,
}

impl RingWalker {
    fn offer(&mut self, ts: OffsetDateTime, raw: u16) -> Option<GlucoseSample> {
        if self.stop_at.is_some_and(|stop| ts <= stop) {
            self.stopped = true;
            return None;
        }
        if raw == 0 {
            return None;
        }
        if self
            .last_emitted
            .is_some_and(|last| last - ts < self.min_spacing)
        {
            return None;
        }
        self.last_emitted = Some(ts);
        Some(GlucoseSample::new(ts, raw_to_mg_dl(raw)))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn per_minute(now: OffsetDateTime) -> RingOptions {
        RingOptions::new(now).min_spacing(Duration::seconds(50))
    }

    #[test]
    fn test_short_image_is_malformed() {
        let err = parse_glucose_ring(&[0u8; 100], &RingOptions::new(now())).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn test_full_trend_ring_per_minute() {
        let mut image = blank_image(3, 1000, 5, 0);
        for slot in 0..TREND_SLOTS {
            set_trend(&mut image, slot, 850 + slot as u16);
        }
        let ring = parse_glucose_ring(&image, &per_minute(now())).unwrap();
        assert_eq!(ring.trend.len(), 16);
        assert_eq!(ring.trend[0].timestamp, now());
        assert_eq!(ring.trend[15].timestamp, now() - Duration::minutes(15));
        // newest slot is the one before the cursor
        assert!((ring.trend[0].raw_value - 854.0 / 8.5).abs() < 1e-9);
        assert!((ring.trend[1].raw_value - 853.0 / 8.5).abs() < 1e-9);
        assert!((ring.trend[5].raw_value - 865.0 / 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_default_spacing_thins_trend() {
        let mut image = blank_image(3, 1000, 0, 0);
        for slot in 0..TREND_SLOTS {
            set_trend(&mut image, slot, 1000);
        }
        let ring = parse_glucose_ring(&image, &RingOptions::new(now())).unwrap();
        let stamps: Vec<_> = ring.trend.iter().map(|s| now() - s.timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                Duration::ZERO,
                Duration::minutes(5),
                Duration::minutes(10),
                Duration::minutes(15)
            ]
        );
    }

    #[test]
    fn test_zero_slots_are_skipped() {
        let mut image = blank_image(3, 1000, 0, 0);
        set_trend(&mut image, 15, 1000);
        set_trend(&mut image, 13, 1000);
        let ring = parse_glucose_ring(&image, &per_minute(now())).unwrap();
        assert_eq!(ring.trend.len(), 2);
        assert!(ring.trend.iter().all(|s| s.raw_value > 0.0));
    }

    #[test]
    fn test_stops_at_known_latest() {
        let mut image = blank_image(3, 1000, 0, 0);
        for slot in 0..TREND_SLOTS {
            set_trend(&mut image, slot, 1000);
        }
        let opts = per_minute(now()).known_latest(Some(now() - Duration::minutes(3)));
        let ring = parse_glucose_ring(&image, &opts).unwrap();
        // 3 minutes newer than known, the one at exactly known is not emitted
        assert_eq!(ring.trend.len(), 3);
        assert!(ring.history.is_empty());
    }

    #[test]
    fn test_tolerance_applies_to_stop_rule() {
        let mut image = blank_image(3, 1000, 0, 0);
        for slot in 0..TREND_SLOTS {
            set_trend(&mut image, slot, 1000);
        }
        // a sample 20s after known is within tolerance and must stop the walk
        let opts = per_minute(now()).known_latest(Some(now() - Duration::seconds(20)));
        let ring = parse_glucose_ring(&image, &opts).unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_not_ready_sensor_yields_empty_ring() {
        let mut image = blank_image(2, 1000, 0, 0);
        set_trend(&mut image, 0, 1000);
        let ring = parse_glucose_ring(&image, &RingOptions::new(now())).unwrap();
        assert_eq!(ring.sensor_state, SensorState::Starting);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_warmup_sensor_yields_empty_ring_with_age() {
        let mut image = blank_image(3, 59, 0, 0);
        set_trend(&mut image, 0, 1000);
        let ring = parse_glucose_ring(&image, &RingOptions::new(now())).unwrap();
        assert_eq!(ring.sensor_age_minutes, 59);
        assert_eq!(ring.sensor_start, now() - Duration::minutes(59));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_history_older_than_trend_only() {
        // age 1008: (1008-3)/15 = 67, 67 % 32 = 3, delay = 0 + 3
        let mut image = blank_image(3, 1008, 0, 3);
        for slot in 0..TREND_SLOTS {
            set_trend(&mut image, slot, 1000);
        }
        for slot in 0..HISTORY_SLOTS {
            set_history(&mut image, slot, 1200);
        }
        let ring = parse_glucose_ring(&image, &per_minute(now())).unwrap();
        let oldest_trend = ring.trend.last().unwrap().timestamp;
        assert!(!ring.history.is_empty());
        assert!(ring.history.iter().all(|s| s.timestamp < oldest_trend));
        // newest history at now - 3 min is inside the trend window, so the first kept is 18 min old
        assert_eq!(ring.history[0].timestamp, now() - Duration::minutes(18));
        for pair in ring.history.windows(2) {
            assert_eq!(pair[0].timestamp - pair[1].timestamp, Duration::minutes(15));
        }
    }

    #[test]
    fn test_history_cursor_out_of_sync() {
        // cursor ahead of the age counter: newest history is one period later
        let image = blank_image(3, 1008, 0, 4);
        let newest = most_recent_history(now(), 1008, 4);
        assert_eq!(newest, now() + Duration::minutes(12));
        assert!(parse_glucose_ring(&image, &RingOptions::new(now())).is_ok());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn trend_wraparound_visits_every_slot_once(cursor in 0u8..16, age in 60u16..20_000) {
                let mut image = blank_image(3, age, cursor, 0);
                for slot in 0..TREND_SLOTS {
                    set_trend(&mut image, slot, 100 + slot as u16);
                }
                let opts = RingOptions::new(now()).min_spacing(Duration::ZERO);
                let ring = parse_glucose_ring(&image, &opts).unwrap();
                prop_assert_eq!(ring.trend.len(), TREND_SLOTS);
                for (k, sample) in ring.trend.iter().enumerate() {
                    let slot = (usize::from(cursor) + TREND_SLOTS - 1 - k) % TREND_SLOTS;
                    let expected = f64::from(100 + slot as u16) / RAW_PER_MG_DL;
                    prop_assert!((sample.raw_value - expected).abs() < 1e-9);
                }
                for pair in ring.trend.windows(2) {
                    prop_assert_eq!(pair[0].timestamp - pair[1].timestamp, Duration::minutes(1));
                }
            }

            #[test]
            fn output_is_strictly_descending(
                raws in proptest::collection::vec(0u16..0x2000, TREND_SLOTS + HISTORY_SLOTS),
                trend_cursor in 0u8..16,
                history_cursor in 0u8..32,
                age in 60u16..20_000,
            ) {
                let mut image = blank_image(3, age, trend_cursor, history_cursor);
                for (i, raw) in raws.iter().enumerate() {
                    if i < TREND_SLOTS {
                        set_trend(&mut image, i, *raw);
                    } else {
                        set_history(&mut image, i - TREND_SLOTS, *raw);
                    }
                }
                let ring = parse_glucose_ring(&image, &RingOptions::new(now())).unwrap();
                let all: Vec<_> = ring.samples().collect();
                for pair in all.windows(2) {
                    prop_assert!(pair[0].timestamp - pair[1].timestamp >= DEFAULT_SAMPLE_SPACING);
                }
                prop_assert!(all.iter().all(|s| s.raw_value > 0.0));
            }

            #[test]
            fn never_panics_on_arbitrary_images(data in proptest::collection::vec(any::<u8>(), 0..400)) {
                let _ = parse_glucose_ring(&data, &RingOptions::new(now()));
            }
        }
    }
}
