//! Deduplication and spacing of decoded samples.
//!
//! Transmitters resend overlapping data all the time: a Libre image holds
//! the last 15 minutes of trend and 8 hours of history, a Dexcom backfill
//! repeats whatever the receiver may have missed. [`SampleReconciler`]
//! turns such a batch into the samples that are actually new.
//!
//! The [`DedupeWatermark`] is the only ordering authority across
//! connection cycles.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use cgm_types::{DEDUPE_TOLERANCE, DEFAULT_SAMPLE_SPACING, GlucoseSample};

/// Timestamp of the newest accepted sample for one sensor.
///
/// Never moves backwards except through [`reset`](Self::reset), which is
/// reserved for sensor changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeWatermark(#[serde(with = "time::serde::rfc3339::option")] Option<OffsetDateTime>);

impl DedupeWatermark {
    /// Nothing accepted yet.
    #[must_use]
    pub fn unknown() -> Self {
        Self(None)
    }

    /// A watermark at `t`.
    #[must_use]
    pub fn at(t: OffsetDateTime) -> Self {
        Self(Some(t))
    }

    /// The watermark instant, if known.
    #[must_use]
    pub fn get(&self) -> Option<OffsetDateTime> {
        self.0
    }

    /// Whether nothing has been accepted yet.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0.is_none()
    }

    /// Move forward to `t`; earlier instants are ignored.
    pub fn advance(&mut self, t: OffsetDateTime) {
        if self.0.is_none_or(|current| t > current) {
            self.0 = Some(t);
        }
    }

    /// Forget the watermark (new sensor).
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Whether a sample at `t` would be a replay.
    #[must_use]
    pub fn covers(&self, t: OffsetDateTime, tolerance: Duration) -> bool {
        self.0.is_some_and(|w| t <= w + tolerance)
    }
}

impl From<Option<OffsetDateTime>> for DedupeWatermark {
    fn from(value: Option<OffsetDateTime>) -> Self {
        Self(value)
    }
}

/// Result of [`SampleReconciler::reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// New samples, oldest first.
    pub accepted: Vec<GlucoseSample>,
    /// Watermark after accepting them.
    pub watermark: DedupeWatermark,
    /// New samples dropped for being outside 20-600 mg/dL.
    pub out_of_range: usize,
}

/// Filters, orders and spaces candidate samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleReconciler {
    /// Samples closer than this collapse to the newest one.
    pub min_spacing: Duration,
    /// Samples within this distance of the watermark are replays.
    pub tolerance: Duration,
}

impl Default for SampleReconciler {
    /// 5 min - 10 s spacing, 30 s tolerance.
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SPACING, DEDUPE_TOLERANCE)
    }
}

impl SampleReconciler {
    /// Reconciler with explicit spacing and tolerance.
    #[must_use]
    pub fn new(min_spacing: Duration, tolerance: Duration) -> Self {
        Self {
            min_spacing,
            tolerance,
        }
    }

    /// Spacing for per-minute trend streaming.
    #[must_use]
    pub fn per_minute() -> Self {
        Self::new(Duration::seconds(50), DEDUPE_TOLERANCE)
    }

    /// Keep the candidates strictly newer than `watermark + tolerance`,
    /// sorted ascending, with clusters closer than `min_spacing` collapsed
    /// to their newest member.
    ///
    /// The returned watermark is the newest accepted timestamp, or the
    /// input watermark when nothing qualified.
    #[must_use]
    pub fn reconcile(&self, candidates: &[GlucoseSample], watermark: DedupeWatermark) -> Reconciled {
        let mut fresh: Vec<GlucoseSample> = candidates
            .iter()
            .filter(|s| !watermark.covers(s.timestamp, self.tolerance))
            .copied()
            .collect();

        let before = fresh.len();
        fresh.retain(|s| s.check_range().is_ok());
        let out_of_range = before - fresh.len();

        // newest first, so each cluster keeps its most recent sample
        fresh.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut accepted: Vec<GlucoseSample> = Vec::with_capacity(fresh.len());
        for sample in fresh {
            let spaced = accepted
                .last()
                .is_none_or(|kept| kept.timestamp - sample.timestamp >= self.min_spacing);
            if spaced {
                accepted.push(sample);
            }
        }
        accepted.reverse();

        let mut watermark = watermark;
        if let Some(newest) = accepted.last() {
            watermark.advance(newest.timestamp);
        }
        Reconciled {
            accepted,
            watermark,
            out_of_range,
        }
    }
}
