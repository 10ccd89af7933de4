//! Assembly of multi-fragment sensor memory images.

use time::{Duration, OffsetDateTime};

/// Outcome of appending a fragment to an accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// More bytes are needed.
    Incomplete,
    /// The buffer reached the expected length; carries the full image.
    Complete(Vec<u8>),
    /// The fragment pushed the buffer past the expected length.
    Overflow {
        /// Length the buffer would have had.
        received: usize,
    },
}

/// Stateless fragment append.
///
/// On `Overflow` the buffer is left untouched so the caller can decide
/// whether to reset. On `Complete` the buffer holds exactly `expected_total`
/// bytes and a copy is returned.
pub fn append_fragment(
    buffer: &mut Vec<u8>,
    fragment: &[u8],
    expected_total: usize,
) -> SnapshotStatus {
    let received = buffer.len() + fragment.len();
    if received > expected_total {
        return SnapshotStatus::Overflow { received };
    }
    buffer.extend_from_slice(fragment);
    if buffer.len() == expected_total {
        SnapshotStatus::Complete(buffer.clone())
    } else {
        SnapshotStatus::Incomplete
    }
}

/// A fixed-size accumulation buffer for one sensor memory image.
///
/// Owned by exactly one session; reset on completion, overflow, timeout
/// and disconnect.
#[derive(Debug, Clone)]
pub struct SensorMemorySnapshot {
    expected_len: usize,
    buf: Vec<u8>,
    first_fragment_at: Option<OffsetDateTime>,
}

impl SensorMemorySnapshot {
    /// Create an empty snapshot expecting `expected_len` bytes.
    #[must_use]
    pub fn new(expected_len: usize) -> Self {
        Self {
            expected_len,
            buf: Vec::with_capacity(expected_len),
            first_fragment_at: None,
        }
    }

    /// Expected image length.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no fragment has been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// When the first fragment of the current image arrived.
    #[must_use]
    pub fn first_fragment_at(&self) -> Option<OffsetDateTime> {
        self.first_fragment_at
    }

    /// Whether the current partial image is older than `window`.
    #[must_use]
    pub fn is_stale(&self, now: OffsetDateTime, window: Duration) -> bool {
        self.first_fragment_at
            .is_some_and(|first| now - first > window)
    }

    /// Discard all accumulated bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.first_fragment_at = None;
    }

    /// Append a fragment received at `now`.
    ///
    /// The snapshot resets itself on `Complete` and `Overflow`.
    pub fn append_fragment(&mut self, fragment: &[u8], now: OffsetDateTime) -> SnapshotStatus {
        if self.buf.is_empty() {
            self.first_fragment_at = Some(now);
        }
        let status = append_fragment(&mut self.buf, fragment, self.expected_len);
        if !matches!(status, SnapshotStatus::Incomplete) {
            self.reset();
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_until_complete() {
        let mut buf = Vec::new();
        assert_eq!(append_fragment(&mut buf, &[1, 2], 4), SnapshotStatus::Incomplete);
        assert_eq!(
            append_fragment(&mut buf, &[3, 4], 4),
            SnapshotStatus::Complete(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn test_overflow_leaves_buffer_untouched() {
        let mut buf = vec![0u8; 3];
        assert_eq!(
            append_fragment(&mut buf, &[1, 2], 4),
            SnapshotStatus::Overflow { received: 5 }
        );
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_snapshot_resets_after_complete() {
        let t = OffsetDateTime::UNIX_EPOCH;
        let mut snap = SensorMemorySnapshot::new(3);
        assert_eq!(snap.append_fragment(&[1], t), SnapshotStatus::Incomplete);
        assert_eq!(snap.first_fragment_at(), Some(t));
        assert!(matches!(snap.append_fragment(&[2, 3], t), SnapshotStatus::Complete(_)));
        assert!(snap.is_empty());
        assert!(snap.first_fragment_at().is_none());
    }

    #[test]
    fn test_snapshot_resets_after_overflow() {
        let t = OffsetDateTime::UNIX_EPOCH;
        let mut snap = SensorMemorySnapshot::new(2);
        snap.append_fragment(&[1], t);
        assert!(matches!(
            snap.append_fragment(&[2, 3], t),
            SnapshotStatus::Overflow { received: 3 }
        ));
        assert!(snap.is_empty());
    }

    #[test]
    fn test_staleness() {
        let t = OffsetDateTime::UNIX_EPOCH;
        let mut snap = SensorMemorySnapshot::new(10);
        assert!(!snap.is_stale(t + Duration::hours(1), Duration::seconds(5)));
        snap.append_fragment(&[1], t);
        assert!(!snap.is_stale(t + Duration::seconds(5), Duration::seconds(5)));
        assert!(snap.is_stale(t + Duration::seconds(6), Duration::seconds(5)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn length_never_exceeds_expected(
                fragments in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..64), 0..20),
                expected in 1usize..400,
            ) {
                let mut snap = SensorMemorySnapshot::new(expected);
                for f in &fragments {
                    if let SnapshotStatus::Complete(image) =
                        snap.append_fragment(f, OffsetDateTime::UNIX_EPOCH)
                    {
                        prop_assert_eq!(image.len(), expected);
                    }
                    prop_assert!(snap.len() <= expected);
                }
            }
        }
    }
}
