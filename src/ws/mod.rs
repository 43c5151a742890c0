//! WebSocket session infrastructure.
//!
//! This module owns everything that touches the socket. A [`Session`] lives for
//! exactly one connection: it performs the handshake, reads frames, keeps the
//! connection alive with PING/PONG and reports how it ended. Reconnection is the
//! supervisor's job, never the session's.
//!
//! # Architecture
//!
//! - [`Session`]: one connection from handshake to termination
//! - [`FrameHandler`]: receives decoded frames from the session's receive loop
//! - [`config::Config`]: keepalive, timeouts and reconnection settings
//!
//! # Example
//!
//! ```ignore
//! let session = Session::open(1, &endpoint, &config).await?;
//! let ended = session.receive_loop(&mut decoder, &mut dispatcher, &cancel).await;
//! println!("session ended: {}", ended.reason);
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod traits;

#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use error::{ConnectCause, ConnectError};
pub use session::{EndReason, Session, SessionEnded, SessionState};
pub use traits::*;
