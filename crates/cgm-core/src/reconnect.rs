//! Reconnection backoff for a known transmitter identity.
//!
//! CGM transmitters drop the link all the time: Libre bridges after every
//! batch, Dexcom transmitters after every five-minute reading. The link
//! manager therefore reconnects to a known identity indefinitely, spacing
//! attempts with [`ReconnectOptions`]. [`Backoff`] tracks the attempt count
//! for one identity.

use std::time::Duration;

use crate::error::{Error, Result};

/// Options for automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    /// Maximum number of reconnection attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to use exponential backoff.
    pub use_exponential_backoff: bool,
}

impl Default for ReconnectOptions {
    /// Unlimited attempts, 1 s doubling up to 60 s.
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_exponential_backoff: true,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options giving up after `attempts` tries.
    pub fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Default::default()
        }
    }

    /// Create options with a fixed delay (no backoff).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            use_exponential_backoff: false,
            ..Default::default()
        }
    }

    /// Set initial delay before first reconnection attempt.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between attempts.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.initial_delay;
        }
        let factor = self.backoff_multiplier.powi(attempt.min(32) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64).min(self.max_delay)
    }

    /// Validate the options.
    ///
    /// Checks that `backoff_multiplier >= 1.0`, `initial_delay > 0` and
    /// `max_delay >= initial_delay`.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("initial_delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config("max_delay must be >= initial_delay"));
        }
        Ok(())
    }
}

/// Attempt counter for one identity.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: ReconnectOptions,
    attempt: u32,
}

impl Backoff {
    /// Start counting from zero.
    pub fn new(options: ReconnectOptions) -> Self {
        Self { options, attempt: 0 }
    }

    /// Attempts made since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.options.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        let delay = self.options.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unlimited() {
        let opts = ReconnectOptions::default();
        assert_eq!(opts.max_attempts, None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_delay_for_attempt() {
        let opts = ReconnectOptions::new()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10));
        assert_eq!(opts.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(opts.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(opts.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(opts.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(opts.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_delay() {
        let opts = ReconnectOptions::fixed_delay(Duration::from_secs(3));
        assert_eq!(opts.delay_for_attempt(7), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(ReconnectOptions::new().backoff_multiplier(0.5).validate().is_err());
        assert!(ReconnectOptions::new().initial_delay(Duration::ZERO).validate().is_err());
        assert!(
            ReconnectOptions::new()
                .initial_delay(Duration::from_secs(10))
                .max_delay(Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_backoff_counts_and_resets() {
        let mut backoff = Backoff::new(ReconnectOptions::bounded(2));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_unlimited_backoff_never_exhausts() {
        let mut backoff = Backoff::new(ReconnectOptions::default());
        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
    }
}
