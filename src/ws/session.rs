use std::fmt;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::config::Config;
use super::error::{ConnectCause, ConnectError, WsError};
use super::traits::FrameHandler;
use crate::decode::{Decoded, Decoder, RawFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a caller-initiated close waits for the Close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a single connection.
///
/// A [`Session`] value only exists once its handshake succeeded, so it starts
/// `Open`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress. Never held by a [`Session`] value: this phase lives
    /// inside [`Session::open`] and is reported as the supervisor's
    /// `Connecting` state.
    Connecting,
    /// Handshake done, frames flowing
    Open,
    /// Orderly shutdown (remote close or caller cancellation)
    Closing,
    /// Terminated by an error or a liveness timeout
    Failed,
}

/// Why a session's receive loop ended.
#[non_exhaustive]
#[derive(Debug)]
pub enum EndReason {
    /// Peer sent a Close frame or ended the stream
    RemoteClosed {
        code: Option<u16>,
        reason: String,
    },
    /// Read or write failed mid-stream
    ProtocolError(WsError),
    /// A PING went unanswered for longer than the liveness timeout
    LivenessTimeout,
    /// The shutdown signal fired
    CancelledByCaller,
}

impl EndReason {
    /// Cancellation is a normal stop, not a failure to retry.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancelledByCaller)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "remote closed ({code}: {reason})")
            }
            Self::RemoteClosed { code: Some(code), .. } => write!(f, "remote closed ({code})"),
            Self::RemoteClosed { code: None, .. } => f.write_str("remote closed"),
            Self::ProtocolError(e) => write!(f, "protocol error: {e}"),
            Self::LivenessTimeout => f.write_str("liveness timeout"),
            Self::CancelledByCaller => f.write_str("cancelled by caller"),
        }
    }
}

/// Terminal report of a session, handed back to the supervisor.
#[non_exhaustive]
#[derive(Debug)]
pub struct SessionEnded {
    /// Supervisor-assigned session number
    pub session: u64,
    pub reason: EndReason,
    /// Either [`SessionState::Closing`] or [`SessionState::Failed`]
    pub state: SessionState,
    /// Time between the handshake completing and the loop ending
    pub uptime: Duration,
    /// Data frames read (text and binary), valid or not
    pub frames: u64,
}

#[derive(Serialize)]
struct SubscribeCommand<'a> {
    command: &'static str,
    value: &'a str,
}

/// Exactly one live WebSocket connection, from handshake to termination.
///
/// The socket is owned by the session and released when
/// [`receive_loop`](Self::receive_loop) returns, whichever branch ends it.
pub struct Session {
    id: u64,
    stream: WsStream,
    state: SessionState,
    opened_at: Instant,
    ping_interval: Duration,
    liveness_timeout: Duration,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Perform the handshake and, if configured, subscribe to the topic.
    ///
    /// Fails fast: no retries happen here.
    pub async fn open(id: u64, endpoint: &Url, config: &Config) -> Result<Self, ConnectError> {
        debug!(session = id, %endpoint, "Opening WebSocket session");

        let (mut stream, _response) =
            timeout(config.connect_timeout, connect_async(endpoint.as_str()))
                .await
                .map_err(|_elapsed| {
                    ConnectError::new(ConnectCause::Timeout(config.connect_timeout))
                })?
                .map_err(|e| ConnectError::new(ConnectCause::Handshake(e)))?;

        if let Some(topic) = &config.subscribe_topic {
            let command = SubscribeCommand {
                command: "SUBSCRIBE",
                value: topic,
            };
            // Serializing two string fields cannot fail.
            let json = serde_json::to_string(&command).unwrap_or_default();
            stream
                .send(Message::Text(json.into()))
                .await
                .map_err(|e| ConnectError::new(ConnectCause::Subscribe(e)))?;
            debug!(session = id, topic, "Sent subscribe command");
        }

        Ok(Self {
            id,
            stream,
            state: SessionState::Open,
            opened_at: Instant::now(),
            ping_interval: config.ping_interval,
            liveness_timeout: config.liveness_timeout,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read frames until the peer closes, an error occurs, the liveness check fails
    /// or `cancel` fires.
    ///
    /// Every data frame is decoded and handed to `handler` before the next one is
    /// read. A PING is sent every `ping_interval`; only one is outstanding at a time.
    pub async fn receive_loop<H: FrameHandler>(
        mut self,
        decoder: &mut Decoder,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> SessionEnded {
        let (mut write, mut read) = self.stream.split();

        let mut ping_interval = interval_at(
            Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;
        let mut ping_seq = 0_u64;
        let mut frames = 0_u64;

        let reason = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break EndReason::CancelledByCaller,

                msg = read.next() => {
                    let raw = match msg {
                        Some(Ok(Message::Text(text))) => RawFrame::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(bytes))) => RawFrame::Binary(bytes.to_vec()),
                        Some(Ok(Message::Pong(_))) => {
                            trace!(session = self.id, "Received PONG");
                            pong_deadline = None;
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => break remote_closed(frame),
                        Some(Ok(_)) => {
                            // Inbound PINGs are answered by the transport.
                            continue;
                        }
                        Some(Err(e)) => break EndReason::ProtocolError(WsError::Connection(e)),
                        None => break remote_closed(None),
                    };

                    frames = frames.saturating_add(1);
                    match decoder.decode(&raw) {
                        Ok(Decoded::Announcement(message)) => {
                            // A slow sink must not hold up shutdown.
                            let cancelled = tokio::select! {
                                biased;

                                () = cancel.cancelled() => true,
                                () = handler.on_message(message) => false,
                            };
                            if cancelled {
                                break EndReason::CancelledByCaller;
                            }
                        }
                        Ok(Decoded::Control(reply)) => handler.on_control(&reply),
                        Err(e) => handler.on_decode_error(&e),
                    }
                }

                _ = ping_interval.tick() => {
                    if pong_deadline.is_some() {
                        continue;
                    }
                    ping_seq = ping_seq.wrapping_add(1);
                    let payload = ping_seq.to_be_bytes().to_vec();
                    if let Err(e) = write.send(Message::Ping(payload.into())).await {
                        break EndReason::ProtocolError(WsError::Connection(e));
                    }
                    trace!(session = self.id, seq = ping_seq, "Sent PING");
                    pong_deadline = Some(Instant::now() + self.liveness_timeout);
                }

                () = liveness_expired(pong_deadline) => {
                    warn!(
                        session = self.id,
                        timeout = ?self.liveness_timeout,
                        "Heartbeat timeout: no PONG received"
                    );
                    break EndReason::LivenessTimeout;
                }
            }
        };

        self.state = match reason {
            EndReason::RemoteClosed { .. } | EndReason::CancelledByCaller => SessionState::Closing,
            EndReason::ProtocolError(_) | EndReason::LivenessTimeout => SessionState::Failed,
        };

        if reason.is_cancellation() {
            // Best effort; the socket is dropped below either way.
            if timeout(CLOSE_GRACE, write.send(Message::Close(None)))
                .await
                .is_err()
            {
                debug!(session = self.id, "Close frame not flushed before grace period");
            }
        }
        drop(write);
        drop(read);

        let uptime = self.opened_at.elapsed();
        info!(
            event = "SessionEnded",
            session = self.id,
            reason = %reason,
            uptime = ?uptime,
            frames,
            "Session ended"
        );

        SessionEnded {
            session: self.id,
            reason,
            state: self.state,
            uptime,
            frames,
        }
    }
}

fn remote_closed(frame: Option<CloseFrame>) -> EndReason {
    match frame {
        Some(frame) => EndReason::RemoteClosed {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_owned(),
        },
        None => EndReason::RemoteClosed {
            code: None,
            reason: String::new(),
        },
    }
}

/// Resolves once an outstanding PING has gone unanswered past its deadline.
async fn liveness_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
