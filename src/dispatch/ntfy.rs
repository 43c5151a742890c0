//! Push notifications through an [ntfy](https://ntfy.sh) server.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bon::Builder;
use tracing::debug;

use super::sink::{NotificationSink, SinkError};
use crate::error::Error;
use crate::types::Announcement;

const DEFAULT_TITLE: &str = "New announcement";

/// ntfy message priority.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Min,
    Low,
    #[default]
    Default,
    High,
    Urgent,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Low => "low",
            Self::Default => "default",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" | "1" => Ok(Self::Min),
            "low" | "2" => Ok(Self::Low),
            "default" | "3" => Ok(Self::Default),
            "high" | "4" => Ok(Self::High),
            "urgent" | "max" | "5" => Ok(Self::Urgent),
            other => Err(Error::validation(format!("unknown ntfy priority: {other}"))),
        }
    }
}

/// Publishes each announcement to `<server>/<topic>`.
///
/// Title, priority and tags travel as query parameters so non-ASCII titles
/// survive intact. Any non-2xx answer is reported as [`SinkError::Rejected`].
///
/// # Example
///
/// ```no_run
/// use announcement_monitor::dispatch::NtfySink;
/// use announcement_monitor::dispatch::ntfy::Priority;
///
/// let sink = NtfySink::builder()
///     .server("https://ntfy.sh")
///     .topic("exchange-announcements")
///     .priority(Priority::High)
///     .tags(vec!["loudspeaker".to_owned()])
///     .build();
/// ```
#[derive(Debug, Clone, Builder)]
pub struct NtfySink {
    /// Base URL of the ntfy server
    #[builder(into)]
    server: String,
    #[builder(into)]
    topic: String,
    #[builder(default)]
    priority: Priority,
    #[builder(default)]
    tags: Vec<String>,
    #[builder(default)]
    client: reqwest::Client,
}

impl NtfySink {
    fn endpoint(&self) -> String {
        format!("{}/{}", self.server.trim_end_matches('/'), self.topic)
    }
}

/// Message body: publication time and link when the payload carries them,
/// otherwise the raw payload.
fn body(message: &Announcement) -> String {
    let mut lines = Vec::new();
    if let Some(published) = message.published_at() {
        lines.push(published.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }
    if let Some(url) = message.url() {
        lines.push(url);
    }
    if lines.is_empty() {
        message.payload.clone()
    } else {
        lines.join("\n")
    }
}

#[async_trait]
impl NotificationSink for NtfySink {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        let title = message.title().unwrap_or_else(|| DEFAULT_TITLE.to_owned());
        let mut query = vec![
            ("title", title.clone()),
            ("priority", self.priority.as_str().to_owned()),
        ];
        if !self.tags.is_empty() {
            query.push(("tags", self.tags.join(",")));
        }

        let response = self
            .client
            .post(self.endpoint())
            .query(&query)
            .body(body(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!(%title, "Notification sent");
        Ok(())
    }
}
