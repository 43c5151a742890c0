//! Reconnection supervisor.
//!
//! The supervisor owns the session lifecycle. It opens a [`Session`], lends it the
//! decoder and dispatcher, and when the session ends it waits out a jittered,
//! capped exponential backoff before opening the next one. Only one session exists
//! at a time, by construction: the next is opened after the previous returned.
//!
//! ```text
//! Idle ──▶ Connecting ──▶ Running
//!              ▲   │         │
//!              │   ▼         ▼
//!              └─ BackingOff ◀┘        any ──shutdown──▶ Stopped
//! ```

pub mod backoff;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, info_span, warn};
use url::Url;

pub use self::backoff::Backoff;
use crate::Result;
use crate::decode::Decoder;
use crate::dispatch::{DispatchCounters, DispatchStats, Dispatcher, NotificationSink};
use crate::error::{Error, Kind};
use crate::ws::config::Config;
use crate::ws::{EndReason, Session, WsError};

/// Capacity of the state transition broadcast.
const TRANSITION_CAPACITY: usize = 64;

/// What sent the supervisor into backoff.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The handshake or subscribe command failed
    Connect,
    RemoteClosed,
    ProtocolError,
    LivenessTimeout,
}

impl Failure {
    fn from_end(reason: &EndReason) -> Option<Self> {
        match reason {
            EndReason::RemoteClosed { .. } => Some(Self::RemoteClosed),
            EndReason::ProtocolError(_) => Some(Self::ProtocolError),
            EndReason::LivenessTimeout => Some(Self::LivenessTimeout),
            EndReason::CancelledByCaller => None,
        }
    }
}

/// Supervisor state machine.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Created, not started
    Idle,
    /// Opening a session
    Connecting {
        /// Number the session will carry once open
        session: u64,
    },
    /// A session is open and streaming
    Running {
        session: u64,
        /// When the session reached Open
        since: Instant,
    },
    /// Waiting before the next connection attempt
    BackingOff {
        /// Consecutive failures since the last stable session
        attempt: u32,
        delay: Duration,
        after: Failure,
    },
    /// Shut down; no further attempts
    Stopped,
}

impl SupervisorState {
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }

    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// A configured announcement monitor, ready to run.
///
/// # Example
///
/// ```no_run
/// use announcement_monitor::Monitor;
/// use announcement_monitor::dispatch::LogSink;
/// use announcement_monitor::ws::config::Config;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> announcement_monitor::Result<()> {
/// let monitor = Monitor::new("wss://api.binance.com/sapi/wss", Config::default(), LogSink)?;
/// let shutdown = CancellationToken::new();
/// let stats = monitor.run(shutdown).await;
/// println!("dispatched {} announcements", stats.dispatched);
/// # Ok(())
/// # }
/// ```
pub struct Monitor<S> {
    endpoint: Url,
    config: Config,
    sink: S,
}

impl<S: NotificationSink> Monitor<S> {
    /// Validate the endpoint and configuration.
    ///
    /// Configuration problems are fatal and reported here, before any connection
    /// attempt is made.
    pub fn new(endpoint: &str, config: Config, sink: S) -> Result<Self> {
        config.validate()?;

        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") || endpoint.host_str().is_none() {
            return Err(Error::with_source(
                Kind::Validation,
                WsError::InvalidEndpoint(endpoint.to_string()),
            ));
        }

        Ok(Self {
            endpoint,
            config,
            sink,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Run on the current task until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> DispatchStats {
        self.into_supervisor().run(shutdown).await
    }

    /// Run on a background task. Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> MonitorHandle {
        let supervisor = self.into_supervisor();
        let token = CancellationToken::new();

        MonitorHandle {
            state_rx: supervisor.state_tx.subscribe(),
            transitions_tx: supervisor.transitions_tx.clone(),
            counters: supervisor.dispatcher.counters(),
            token: DroppingCancellationToken(token.clone()),
            join: tokio::spawn(supervisor.run(token)),
        }
    }

    fn into_supervisor(self) -> Supervisor<S> {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CAPACITY);

        Supervisor {
            dispatcher: Dispatcher::new(self.sink, &self.config),
            backoff: Backoff::new(&self.config.reconnect),
            decoder: Decoder::new(),
            endpoint: self.endpoint,
            config: self.config,
            state_tx,
            transitions_tx,
            last_session: 0,
        }
    }
}

struct Supervisor<S> {
    endpoint: Url,
    config: Config,
    decoder: Decoder,
    dispatcher: Dispatcher<S>,
    backoff: Backoff,
    state_tx: watch::Sender<SupervisorState>,
    transitions_tx: broadcast::Sender<SupervisorState>,
    last_session: u64,
}

impl<S: NotificationSink> Supervisor<S> {
    async fn run(mut self, shutdown: CancellationToken) -> DispatchStats {
        info!(endpoint = %self.endpoint, "Starting announcement monitor");

        while !shutdown.is_cancelled() {
            self.last_session = self.last_session.saturating_add(1);
            let id = self.last_session;
            self.set_state(SupervisorState::Connecting { session: id });

            let opened = tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                opened = Session::open(id, &self.endpoint, &self.config) => opened,
            };

            let failure = match opened {
                Ok(session) => {
                    self.set_state(SupervisorState::Running {
                        session: id,
                        since: Instant::now(),
                    });
                    info!(session = id, endpoint = %self.endpoint, "Connected");

                    let ended = session
                        .receive_loop(&mut self.decoder, &mut self.dispatcher, &shutdown)
                        .instrument(info_span!("session", id))
                        .await;

                    let Some(failure) = Failure::from_end(&ended.reason) else {
                        break;
                    };
                    if self.backoff.session_ended(ended.uptime) {
                        debug!(session = id, uptime = ?ended.uptime, "Session was stable, backoff reset");
                    }
                    failure
                }
                Err(e) => {
                    warn!(session = id, error = %e, "Unable to connect");
                    Failure::Connect
                }
            };

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.consecutive_failures();
            self.set_state(SupervisorState::BackingOff {
                attempt,
                delay,
                after: failure,
            });
            info!(
                event = "BackoffScheduled",
                delay = ?delay,
                attempt,
                after = ?failure,
                "Reconnecting after backoff"
            );

            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.set_state(SupervisorState::Stopped);
        let stats = self.dispatcher.stats();
        info!(
            dispatched = stats.dispatched,
            duplicates = stats.duplicates,
            decode_errors = stats.decode_errors,
            sink_failures = stats.sink_failures,
            "Announcement monitor stopped"
        );
        stats
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(?state, "Supervisor state changed");
        self.state_tx.send_replace(state);
        _ = self.transitions_tx.send(state);
    }
}

/// Cancels the inner token when dropped, so dropping a [`MonitorHandle`] stops the
/// background task. Kept as a separate type so [`MonitorHandle::shutdown`] can move
/// fields out of the handle.
#[derive(Debug)]
struct DroppingCancellationToken(CancellationToken);

impl Drop for DroppingCancellationToken {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Handle to a monitor running on a background task.
///
/// Dropping the handle shuts the monitor down.
#[derive(Debug)]
pub struct MonitorHandle {
    state_rx: watch::Receiver<SupervisorState>,
    transitions_tx: broadcast::Sender<SupervisorState>,
    counters: Arc<DispatchCounters>,
    token: DroppingCancellationToken,
    join: JoinHandle<DispatchStats>,
}

impl MonitorHandle {
    /// Get the current supervisor state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Subscribe to supervisor state changes (latest value only).
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Subscribe to every state transition from now on, in order.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<SupervisorState> {
        self.transitions_tx.subscribe()
    }

    /// Current dispatch counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Token that stops the monitor when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.0.clone()
    }

    /// Signal shutdown and wait for the supervisor to reach
    /// [`SupervisorState::Stopped`].
    pub async fn shutdown(self) -> Result<DispatchStats> {
        self.token.0.cancel();
        Ok(self.join.await?)
    }
}
