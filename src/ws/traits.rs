//! Seam between a session's receive loop and whatever consumes its frames.

use async_trait::async_trait;
use serde_json::Value;

use crate::decode::DecodeError;
use crate::types::Announcement;

/// Receives the outcome of every frame a session reads, in wire order.
///
/// The session awaits [`FrameHandler::on_message`] before reading the next frame,
/// which is what makes delivery FIFO within a session. Implementations must not
/// report failures back: nothing a handler does can end the session.
///
/// # Example
///
/// ```ignore
/// struct Collect(Vec<Announcement>);
///
/// #[async_trait]
/// impl FrameHandler for Collect {
///     async fn on_message(&mut self, message: Announcement) {
///         self.0.push(message);
///     }
/// }
/// ```
#[async_trait]
pub trait FrameHandler: Send {
    /// A decoded announcement.
    async fn on_message(&mut self, message: Announcement);

    /// A frame that failed to decode and was dropped.
    fn on_decode_error(&mut self, _error: &DecodeError) {}

    /// A reply to a command the session sent.
    fn on_control(&mut self, _reply: &Value) {}
}
