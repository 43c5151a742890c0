//! Envelope decoding for raw feed frames.
//!
//! The feed wraps every announcement in a small JSON envelope:
//!
//! ```json
//! {"type":"DATA","topic":"com_announcement_en","data":"{\"id\":\"123\",\"title\":\"...\"}"}
//! ```
//!
//! `data` is either an object or a string holding the announcement body. Replies to
//! our own subscribe command arrive as `{"type":"COMMAND",...}` and are surfaced as
//! [`Decoded::Control`] rather than as errors.

use std::error::Error as StdError;
use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::types::{Announcement, AnnouncementId};

const COMMAND_FRAME_TYPE: &str = "COMMAND";

/// A frame as read off the socket, before any interpretation.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RawFrame {
    /// Lossy text rendering used when reporting a frame that failed to decode.
    #[must_use]
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// Successful outcome of decoding one frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// An announcement to hand to the dispatch pipeline
    Announcement(Announcement),
    /// A reply to a command we sent (e.g. the subscribe acknowledgement)
    Control(Value),
}

/// Why a frame was rejected.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeReason {
    /// Frame was empty or whitespace only
    Empty,
    /// Binary frame did not contain UTF-8 text
    InvalidUtf8,
    /// Frame was not valid JSON
    Malformed(String),
    /// Frame was valid JSON but not an object
    NotAnObject,
    /// Envelope carried no `data` member
    MissingData,
    /// `data` member was neither an object nor a non-empty string
    UnsupportedData,
}

impl fmt::Display for DecodeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty frame"),
            Self::InvalidUtf8 => f.write_str("binary frame is not valid UTF-8"),
            Self::Malformed(e) => write!(f, "malformed JSON: {e}"),
            Self::NotAnObject => f.write_str("expected a JSON object"),
            Self::MissingData => f.write_str("envelope has no `data` member"),
            Self::UnsupportedData => f.write_str("unsupported `data` member"),
        }
    }
}

/// A frame that could not be decoded. The frame is dropped, never retried.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub reason: DecodeReason,
    pub raw_frame: String,
}

impl DecodeError {
    fn new(reason: DecodeReason, frame: &RawFrame) -> Self {
        Self {
            reason,
            raw_frame: frame.to_text_lossy(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode frame: {}", self.reason)
    }
}

impl StdError for DecodeError {}

/// Turns raw frames into [`Announcement`]s.
///
/// The only state is the counter used for synthetic ids. The supervisor keeps one
/// decoder for its whole lifetime so synthetic ids stay monotonic across reconnects.
#[derive(Debug, Default)]
pub struct Decoder {
    last_sequence: u64,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single frame.
    pub fn decode(&mut self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        let text = match frame {
            RawFrame::Text(text) => text.as_str(),
            RawFrame::Binary(bytes) => std::str::from_utf8(bytes)
                .map_err(|_e| DecodeError::new(DecodeReason::InvalidUtf8, frame))?,
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::new(DecodeReason::Empty, frame));
        }

        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| DecodeError::new(DecodeReason::Malformed(e.to_string()), frame))?;
        let Value::Object(mut envelope) = value else {
            return Err(DecodeError::new(DecodeReason::NotAnObject, frame));
        };

        if envelope.get("type").and_then(Value::as_str) == Some(COMMAND_FRAME_TYPE) {
            return Ok(Decoded::Control(Value::Object(envelope)));
        }

        let (payload, body) = match envelope.remove("data") {
            None | Some(Value::Null) => {
                return Err(DecodeError::new(DecodeReason::MissingData, frame));
            }
            Some(Value::String(s)) if !s.trim().is_empty() => {
                let body = match serde_json::from_str::<Value>(&s) {
                    Ok(Value::Object(map)) => Some(map),
                    _ => None,
                };
                (s, body)
            }
            Some(Value::Object(map)) => (Value::Object(map.clone()).to_string(), Some(map)),
            Some(_) => return Err(DecodeError::new(DecodeReason::UnsupportedData, frame)),
        };

        let id = body
            .as_ref()
            .and_then(id_from)
            .or_else(|| id_from(&envelope))
            .unwrap_or_else(|| self.next_synthetic());

        let topic = envelope
            .get("topic")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        Ok(Decoded::Announcement(Announcement {
            id,
            topic,
            payload,
            received_at: Utc::now(),
        }))
    }

    fn next_synthetic(&mut self) -> AnnouncementId {
        self.last_sequence = self.last_sequence.saturating_add(1);
        AnnouncementId::Synthetic(self.last_sequence)
    }
}

fn id_from(map: &Map<String, Value>) -> Option<AnnouncementId> {
    match map.get("id")? {
        Value::String(s) if !s.is_empty() => Some(AnnouncementId::Feed(s.clone())),
        Value::Number(n) => Some(AnnouncementId::Feed(n.to_string())),
        _ => None,
    }
}
