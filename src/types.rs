//! Values flowing from the decoder to the notification sink.

use std::fmt;

use bon::Builder;
/// Date and time types used for announcement timestamps.
pub use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Identity of an announcement.
///
/// The feed usually provides its own identifier. When it does not, the decoder
/// assigns a monotonically increasing synthetic one instead.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum AnnouncementId {
    /// Identifier supplied by the feed
    Feed(String),
    /// Sequence number assigned locally because the feed supplied none
    Synthetic(u64),
}

impl AnnouncementId {
    /// Whether the identifier originated from the feed itself.
    #[must_use]
    pub const fn is_feed(&self) -> bool {
        matches!(self, Self::Feed(_))
    }
}

impl fmt::Display for AnnouncementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed(id) => f.write_str(id),
            Self::Synthetic(seq) => write!(f, "#{seq}"),
        }
    }
}

/// A single decoded announcement.
///
/// Immutable once decoded: it is handed to the dispatch pipeline exactly once and
/// then dropped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Builder)]
pub struct Announcement {
    /// Feed-provided or synthetic identifier
    pub id: AnnouncementId,
    /// Topic the envelope was published on, if the feed names one
    pub topic: Option<String>,
    /// Announcement body exactly as carried by the envelope's `data` member
    #[builder(into)]
    pub payload: String,
    /// When the frame was read from the socket
    #[builder(default = Utc::now())]
    pub received_at: DateTime<Utc>,
}

impl Announcement {
    /// Headline of the announcement, if the payload is a JSON object with a `title`.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        self.field("title")
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
    }

    /// Link to the full announcement, if present.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.field("url")
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
    }

    /// Publication time taken from `publishDate` (Unix milliseconds).
    #[must_use]
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.field("publishDate")?.as_i64()?;
        DateTime::from_timestamp_millis(millis)
    }

    fn field(&self, name: &str) -> Option<Value> {
        let mut value: Value = serde_json::from_str(&self.payload).ok()?;
        value.get_mut(name).map(Value::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(payload: &str) -> Announcement {
        Announcement::builder()
            .id(AnnouncementId::Synthetic(1))
            .payload(payload)
            .build()
    }

    #[test]
    fn accessors_read_common_fields() {
        let msg = announcement(
            r#"{"id":"42","title":"Binance Will List FOO","url":"https://example.com/a/42","publishDate":1700000000000}"#,
        );

        assert_eq!(msg.title().as_deref(), Some("Binance Will List FOO"));
        assert_eq!(msg.url().as_deref(), Some("https://example.com/a/42"));
        assert_eq!(
            msg.published_at(),
            DateTime::from_timestamp_millis(1_700_000_000_000)
        );
    }

    #[test]
    fn accessors_tolerate_plain_text_payload() {
        let msg = announcement("maintenance tonight");

        assert!(msg.title().is_none());
        assert!(msg.url().is_none());
        assert!(msg.published_at().is_none());
    }

    #[test]
    fn id_display() {
        assert_eq!(AnnouncementId::Feed("abc".to_owned()).to_string(), "abc");
        assert_eq!(AnnouncementId::Synthetic(7).to_string(), "#7");
    }
}
