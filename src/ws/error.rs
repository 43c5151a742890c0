#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Endpoint URL is not a `ws://` or `wss://` URL
    InvalidEndpoint(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::InvalidEndpoint(endpoint) => {
                write!(f, "invalid WebSocket endpoint: {endpoint}")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::InvalidEndpoint(_) => None,
        }
    }
}

/// What went wrong while opening a session.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectCause {
    /// Handshake did not finish within the connect timeout
    Timeout(Duration),
    /// DNS, TCP, TLS or HTTP upgrade failure
    Handshake(tokio_tungstenite::tungstenite::Error),
    /// Connected, but the subscribe command could not be sent
    Subscribe(tokio_tungstenite::tungstenite::Error),
}

/// Failure to establish a session. Opening never retries internally.
#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectError {
    pub cause: ConnectCause,
}

impl ConnectError {
    #[must_use]
    pub const fn new(cause: ConnectCause) -> Self {
        Self { cause }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            ConnectCause::Timeout(timeout) => {
                write!(f, "handshake did not complete within {timeout:?}")
            }
            ConnectCause::Handshake(e) => write!(f, "handshake failed: {e}"),
            ConnectCause::Subscribe(e) => write!(f, "subscribe command failed: {e}"),
        }
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.cause {
            ConnectCause::Handshake(e) | ConnectCause::Subscribe(e) => Some(e),
            ConnectCause::Timeout(_) => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<ConnectError> for crate::error::Error {
    fn from(e: ConnectError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}
