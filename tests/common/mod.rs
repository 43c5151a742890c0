#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    dead_code,
    reason = "Each test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use announcement_monitor::SupervisorState;
use announcement_monitor::dispatch::{NotificationSink, SinkError};
use announcement_monitor::types::Announcement;
use announcement_monitor::ws::config::Config;
use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Upper bound on any single wait in the integration tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// What the mock server pushes to its connected clients.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Mock announcement feed.
///
/// Every accepted connection gets the frames broadcast after it connected. Text
/// frames sent by clients (the subscribe command) are collected in order.
pub struct MockFeedServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    frame_tx: broadcast::Sender<ServerFrame>,
    /// Text frames received from clients
    command_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
    /// When set, new connections complete the handshake and are then never read
    /// from, so PINGs go unanswered.
    silent: Arc<AtomicBool>,
}

impl MockFeedServer {
    /// Start a mock feed server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frame_tx, _) = broadcast::channel::<ServerFrame>(100);
        let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));
        let silent = Arc::new(AtomicBool::new(false));

        let broadcast_tx = frame_tx.clone();
        let accepted = Arc::clone(&connections);
        let silent_flag = Arc::clone(&silent);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                if silent_flag.load(Ordering::SeqCst) {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        drop(ws_stream);
                    });
                    continue;
                }

                let (mut write, mut read) = ws_stream.split();
                let command_tx = command_tx.clone();
                let mut frame_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(command_tx.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            frame = frame_rx.recv() => {
                                match frame {
                                    Ok(ServerFrame::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerFrame::Close { code, reason }) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: reason.into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            frame_tx,
            command_rx,
            connections,
            silent,
        }
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/sapi/wss", self.addr)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, text: &str) {
        drop(self.frame_tx.send(ServerFrame::Text(text.to_owned())));
    }

    /// Close every connected client with the given code and reason.
    pub fn close_all(&self, code: u16, reason: &str) {
        drop(self.frame_tx.send(ServerFrame::Close {
            code,
            reason: reason.to_owned(),
        }));
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Number of handshakes completed so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Receive the next text frame sent by a client.
    pub async fn recv_command(&mut self) -> Option<String> {
        timeout(WAIT, self.command_rx.recv()).await.ok().flatten()
    }
}

/// Sink that forwards every announcement to a channel.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Announcement>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Announcement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        self.tx
            .send(message.clone())
            .map_err(|e| SinkError::Other(e.to_string()))
    }
}

/// Sink that never completes. Reports each announcement it was handed first.
#[derive(Debug, Clone)]
pub struct StalledSink {
    entered: mpsc::UnboundedSender<Announcement>,
}

impl StalledSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Announcement>) {
        let (entered, rx) = mpsc::unbounded_channel();
        (Self { entered }, rx)
    }
}

#[async_trait]
impl NotificationSink for StalledSink {
    async fn notify(&self, message: &Announcement) -> Result<(), SinkError> {
        drop(self.entered.send(message.clone()));
        std::future::pending().await
    }
}

/// Configuration with short backoffs so reconnect tests finish quickly.
#[must_use]
pub fn config() -> Config {
    let mut config = Config::default();
    config.connect_timeout = Duration::from_secs(2);
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

/// A feed frame carrying one announcement, with the body as a JSON string the
/// way the live feed sends it.
#[must_use]
pub fn announcement_frame(id: &str, title: &str) -> String {
    let body = json!({
        "id": id,
        "title": title,
        "url": format!("https://example.com/announcements/{id}"),
        "publishDate": 1_700_000_000_000_i64,
    });
    json!({
        "type": "DATA",
        "topic": "com_announcement_en",
        "data": body.to_string(),
    })
    .to_string()
}

/// Wait for the next announcement delivered to a [`RecordingSink`].
pub async fn next_announcement(rx: &mut mpsc::UnboundedReceiver<Announcement>) -> Announcement {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an announcement")
        .expect("sink channel closed")
}

/// Wait for the first transition matching `predicate`.
pub async fn wait_for_state<F>(
    transitions: &mut broadcast::Receiver<SupervisorState>,
    predicate: F,
) -> SupervisorState
where
    F: Fn(SupervisorState) -> bool,
{
    timeout(WAIT, async {
        loop {
            let state = transitions.recv().await.unwrap();
            if predicate(state) {
                return state;
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor state")
}
