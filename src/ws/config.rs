#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::Result;
use crate::error::Error;

const DEFAULT_PING_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_LIVENESS_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_NOTIFY_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_DEDUP_WINDOW: usize = 256;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_STABILITY_WINDOW_DURATION: Duration = Duration::from_secs(60);

/// Topic the announcement feed publishes English announcements on.
pub const DEFAULT_TOPIC: &str = "com_announcement_en";

/// Configuration for the monitor's connection, keepalive and dispatch behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending WebSocket PING frames to keep the connection alive
    pub ping_interval: Duration,
    /// Maximum time to wait for a PONG before the connection is considered dead
    pub liveness_timeout: Duration,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Topic to send a `SUBSCRIBE` command for once connected. `None` sends nothing.
    pub subscribe_topic: Option<String>,
    /// Number of recent feed ids remembered to suppress duplicate deliveries
    pub dedup_window: usize,
    /// Upper bound on a single notification sink call
    pub notify_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL_DURATION,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            subscribe_topic: Some(DEFAULT_TOPIC.to_owned()),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(Error::validation("ping interval must be non-zero"));
        }
        if self.liveness_timeout.is_zero() {
            return Err(Error::validation("liveness timeout must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::validation("connect timeout must be non-zero"));
        }
        if self.notify_timeout.is_zero() {
            return Err(Error::validation("notify timeout must be non-zero"));
        }
        if self
            .subscribe_topic
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err(Error::validation("subscribe topic must not be blank"));
        }
        self.reconnect.validate()
    }
}

/// Configuration for automatic reconnection behavior.
///
/// Reconnection never gives up on transient failures; the delay is capped at
/// `max_backoff` instead.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Relative jitter applied to every delay, e.g. `0.2` for ±20%
    pub jitter: f64,
    /// How long a session must stay open before the failure count resets
    pub stability_window: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
            stability_window: DEFAULT_STABILITY_WINDOW_DURATION,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::validation("initial backoff must be non-zero"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::validation(format!(
                "max backoff {:?} is below initial backoff {:?}",
                self.max_backoff, self.initial_backoff
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation("backoff multiplier must be at least 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::validation("jitter must be within [0, 1)"));
        }
        Ok(())
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(config.jitter)
            .with_max_elapsed_time(None) // Never give up on transient failures
            .build()
    }
}
