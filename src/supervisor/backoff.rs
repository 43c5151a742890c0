use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use crate::ws::config::ReconnectConfig;

/// Reconnection delay policy.
///
/// Wraps [`ExponentialBackoff`] so the k-th consecutive failure waits roughly
/// `initial * multiplier^(k-1)`, jittered, and never longer than `max_backoff`.
/// The escalation only resets after a session has proven itself stable.
#[derive(Debug)]
pub struct Backoff {
    inner: ExponentialBackoff,
    max_delay: Duration,
    stability_window: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            inner: config.clone().into(),
            max_delay: config.max_backoff,
            stability_window: config.stability_window,
            consecutive_failures: 0,
        }
    }

    /// Failures since the last stable session.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay the next failure will be based on, before jitter.
    #[must_use]
    pub fn nominal_delay(&self) -> Duration {
        self.inner.current_interval.min(self.max_delay)
    }

    /// Register a failure and return how long to wait before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.inner
            .next_backoff()
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Account for a session that reached Open and later ended.
    ///
    /// Returns `true` if it stayed up long enough to reset the escalation.
    pub fn session_ended(&mut self, uptime: Duration) -> bool {
        if uptime >= self.stability_window {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.inner.reset();
    }
}
