use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::types::Announcement;

/// Failure reported by a [`NotificationSink`].
#[non_exhaustive]
#[derive(Debug)]
pub enum SinkError {
    /// HTTP transport failure
    Http(reqwest::Error),
    /// Remote service answered with a non-success status
    Rejected { status: u16, message: String },
    /// The sink did not finish within the configured notify timeout
    Timeout(Duration),
    /// Any other failure from a custom sink
    Other(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "notification request failed: {e}"),
            Self::Rejected { status, message } => {
                write!(f, "notification rejected with status {status}: {message}")
            }
            Self::Timeout(timeout) => write!(f, "notification timed out after {timeout:?}"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

impl StdError for SinkError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<SinkError> for crate::error::Error {
    fn from(e: SinkError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Sink, e)
    }
}

/// Where announcements end up: a console, a webhook, a queue.
///
/// Supplied by the embedding application. A failure is logged and counted by the
/// dispatcher and never retried; wrap the sink to add retries.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        (**self).notify(message).await
    }
}

#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Box<T> {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        (**self).notify(message).await
    }
}

/// Writes each announcement as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        let published = message
            .published_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());

        info!(
            event = "Announcement",
            id = %message.id,
            title = message.title().as_deref().unwrap_or("<untitled>"),
            published = published.as_deref().unwrap_or("-"),
            url = message.url().as_deref().unwrap_or("-"),
            "New announcement"
        );
        Ok(())
    }
}
