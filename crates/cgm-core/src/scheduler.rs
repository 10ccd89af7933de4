//! Timers for protocol steps, decoupled from the wall clock.
//!
//! Sessions ask for timers by [`TimerKind`]; the coordinator keeps them in a
//! [`Scheduler`] and waits on the earliest one. Deadlines are absolute
//! [`OffsetDateTime`]s taken from a [`Clock`], so tests can substitute a
//! [`VirtualClock`] and move time by hand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Timers a session may arm. At most one of each kind is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Ack to the wake-up response must arrive within this window.
    AckWindow,
    /// Fragments of one memory image must all arrive within this window.
    FragmentWindow,
    /// The now-block answer is stale after this window.
    NowBlockWindow,
    /// A partially received data packet is discarded after this window.
    PacketWindow,
    /// A command that must follow another after a short pause.
    DelayedCommand,
}

/// Source of the current time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC instant.
    fn now(&self) -> OffsetDateTime;

    /// Sleep for `duration` as measured by this clock.
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock for tests.
///
/// Time follows tokio's clock (so `start_paused` tests advance it with
/// `tokio::time::advance`) plus a manual offset moved by [`advance`].
/// Sleepers wake on either.
///
/// [`advance`]: VirtualClock::advance
#[derive(Debug)]
pub struct VirtualClock {
    base: OffsetDateTime,
    started: Instant,
    offset_ms: AtomicU64,
    advanced: Notify,
}

impl VirtualClock {
    /// A clock reading `base` now.
    pub fn new(base: OffsetDateTime) -> Arc<Self> {
        Arc::new(Self {
            base,
            started: Instant::now(),
            offset_ms: AtomicU64::new(0),
            advanced: Notify::new(),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
        self.advanced.notify_waiters();
    }

    fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> OffsetDateTime {
        self.base + self.started.elapsed() + self.offset()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            let remaining = deadline - self.now();
            if remaining <= time::Duration::ZERO {
                return;
            }
            let wait = Duration::try_from(remaining).unwrap_or_default();
            let advanced = self.advanced.notified();
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = advanced => {}
            }
        }
    }
}

/// Pending timers, one per [`TimerKind`].
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    deadlines: HashMap<TimerKind, OffsetDateTime>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("deadlines", &self.deadlines)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// An empty scheduler on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deadlines: HashMap::new(),
        }
    }

    /// Arm `kind` to fire `duration` from now, replacing any pending one.
    pub fn schedule_after(&mut self, kind: TimerKind, duration: Duration) {
        let deadline = self.clock.now() + duration;
        self.deadlines.insert(kind, deadline);
    }

    /// Disarm `kind`.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Disarm everything.
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Whether nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// The earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<(TimerKind, OffsetDateTime)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: OffsetDateTime) -> Vec<TimerKind> {
        let mut due: Vec<(TimerKind, OffsetDateTime)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*kind, *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        for (kind, _) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(kind, _)| kind).collect()
    }

    /// Wait until the earliest timer is due. Never completes when empty.
    pub async fn sleep_until_next(&self) {
        let Some((_, deadline)) = self.next_deadline() else {
            return std::future::pending().await;
        };
        let remaining = deadline - self.clock.now();
        if remaining > time::Duration::ZERO {
            self.clock
                .sleep(Duration::try_from(remaining).unwrap_or_default())
                .await;
        }
    }
}
