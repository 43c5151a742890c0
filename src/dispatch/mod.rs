//! Hand-off from decoded announcements to the notification sink.
//!
//! The [`Dispatcher`] is owned by the supervisor and lent to whichever session is
//! active, so its duplicate-suppression window outlives any single connection.

pub mod ntfy;
pub mod sink;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use ntfy::NtfySink;
pub use sink::{LogSink, NotificationSink, SinkError};

use crate::decode::DecodeError;
use crate::types::{Announcement, AnnouncementId};
use crate::ws::FrameHandler;
use crate::ws::config::Config;

/// Outcome of dispatching one announcement.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The sink accepted the announcement
    Delivered,
    /// The id was seen recently; the sink was not called
    Duplicate,
    /// The sink failed or timed out
    Failed,
}

/// Point-in-time copy of the dispatch counters.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub duplicates: u64,
    pub sink_failures: u64,
    pub decode_errors: u64,
    pub control_frames: u64,
}

/// Live counters, shared with monitor handles.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    dispatched: AtomicU64,
    duplicates: AtomicU64,
    sink_failures: AtomicU64,
    decode_errors: AtomicU64,
    control_frames: AtomicU64,
}

impl DispatchCounters {
    #[must_use]
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded memory of recently delivered feed ids.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`, returning `false` if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.order.push_back(id.to_owned());
        self.members.insert(id.to_owned());
        true
    }
}

/// Forwards announcements to a [`NotificationSink`], once each, in arrival order.
///
/// Sink failures stay here: they are logged and counted, never surfaced to the
/// session, so a broken webhook cannot force a reconnect.
pub struct Dispatcher<S> {
    sink: S,
    notify_timeout: Duration,
    recent: RecentIds,
    counters: Arc<DispatchCounters>,
}

impl<S: NotificationSink> Dispatcher<S> {
    #[must_use]
    pub fn new(sink: S, config: &Config) -> Self {
        Self {
            sink,
            notify_timeout: config.notify_timeout,
            recent: RecentIds::new(config.dedup_window),
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    /// Shared handle onto this dispatcher's counters.
    #[must_use]
    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Deliver one announcement to the sink.
    pub async fn dispatch(&mut self, message: Announcement) -> Delivery {
        if let AnnouncementId::Feed(id) = &message.id
            && !self.recent.insert(id)
        {
            DispatchCounters::bump(&self.counters.duplicates);
            debug!(id = %message.id, "Skipping duplicate announcement");
            return Delivery::Duplicate;
        }

        let result = match timeout(self.notify_timeout, self.sink.notify(&message)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SinkError::Timeout(self.notify_timeout)),
        };

        match result {
            Ok(()) => {
                DispatchCounters::bump(&self.counters.dispatched);
                info!(
                    event = "MessageDispatched",
                    id = %message.id,
                    topic = message.topic.as_deref().unwrap_or("-"),
                    "Announcement dispatched"
                );
                Delivery::Delivered
            }
            Err(e) => {
                DispatchCounters::bump(&self.counters.sink_failures);
                warn!(id = %message.id, error = %e, "Notification sink failed");
                Delivery::Failed
            }
        }
    }
}

#[async_trait]
impl<S: NotificationSink> FrameHandler for Dispatcher<S> {
    async fn on_message(&mut self, message: Announcement) {
        self.dispatch(message).await;
    }

    fn on_decode_error(&mut self, error: &DecodeError) {
        DispatchCounters::bump(&self.counters.decode_errors);
        warn!(event = "DecodeError", reason = %error.reason, "Dropping undecodable frame");
        debug!(raw_frame = %error.raw_frame, "Undecodable frame contents");
    }

    fn on_control(&mut self, reply: &Value) {
        DispatchCounters::bump(&self.counters.control_frames);
        info!(reply = %reply, "Received command response");
    }
}
