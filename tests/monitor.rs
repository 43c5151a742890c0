#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::time::{Duration, Instant};

use announcement_monitor::error::Kind;
use announcement_monitor::types::AnnouncementId;
use announcement_monitor::ws::WsError;
use announcement_monitor::{Failure, Monitor, SupervisorState};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::common::{
    MockFeedServer, RecordingSink, StalledSink, WAIT, announcement_frame, config,
    next_announcement, wait_for_state,
};

fn feed(id: &str) -> AnnouncementId {
    AnnouncementId::Feed(id.to_owned())
}

#[tokio::test]
async fn delivers_valid_frames_and_survives_malformed_one() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();

    let subscribe = server.recv_command().await.unwrap();
    assert_eq!(
        subscribe,
        r#"{"command":"SUBSCRIBE","value":"com_announcement_en"}"#
    );
    let running = wait_for_state(&mut transitions, SupervisorState::is_running).await;

    server.send(&announcement_frame("1", "First"));
    server.send("{not json");
    server.send(&announcement_frame("2", "Second"));
    server.send(&announcement_frame("3", "Third"));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(next_announcement(&mut received).await.id);
    }
    assert_eq!(ids, [feed("1"), feed("2"), feed("3")]);

    let stats = handle.stats();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(handle.state(), running, "malformed frame must not end the session");
    assert_eq!(server.connections(), 1);

    let stats = handle.shutdown().await.unwrap();
    assert_eq!(stats.dispatched, 3);
}

#[tokio::test]
async fn announcement_fields_reach_the_sink() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    server.recv_command().await.unwrap();

    server.send(&announcement_frame("77", "Binance Will List FOO"));
    let message = next_announcement(&mut received).await;

    assert_eq!(message.title().as_deref(), Some("Binance Will List FOO"));
    assert_eq!(
        message.url().as_deref(),
        Some("https://example.com/announcements/77")
    );
    assert_eq!(message.topic.as_deref(), Some("com_announcement_en"));
    assert_eq!(
        message.published_at().unwrap().timestamp_millis(),
        1_700_000_000_000
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn command_replies_are_not_notified() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    server.recv_command().await.unwrap();

    server.send(r#"{"type":"COMMAND","subType":"SUBSCRIBE","data":"SUCCESS","code":"00000000"}"#);
    server.send(&announcement_frame("9", "After ack"));

    let message = next_announcement(&mut received).await;
    assert_eq!(message.id, feed("9"));

    let stats = handle.shutdown().await.unwrap();
    assert_eq!(stats.control_frames, 1);
    assert_eq!(stats.dispatched, 1);
}

#[tokio::test]
async fn reconnects_after_remote_close() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();
    server.recv_command().await.unwrap();

    server.close_all(1001, "maintenance");

    let backing_off = wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::BackingOff { .. })
    })
    .await;
    let SupervisorState::BackingOff {
        attempt,
        delay,
        after,
    } = backing_off
    else {
        unreachable!()
    };
    assert_eq!(after, Failure::RemoteClosed);
    assert_eq!(attempt, 1);
    assert!(delay <= Duration::from_millis(200), "{delay:?}");

    wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::Running { session: 2, .. })
    })
    .await;
    server.recv_command().await.unwrap();

    server.send(&announcement_frame("after", "After reconnect"));
    assert_eq!(next_announcement(&mut received).await.id, feed("after"));
    assert_eq!(server.connections(), 2);

    handle.shutdown().await.unwrap();
}

/// Wait for `session` to run, close it from the server after `hold`, and return
/// the attempt number and delay of the backoff that follows.
async fn close_session_after(
    server: &mut MockFeedServer,
    transitions: &mut broadcast::Receiver<SupervisorState>,
    session: u64,
    hold: Duration,
) -> (u32, Duration) {
    wait_for_state(transitions, |s| {
        matches!(s, SupervisorState::Running { session: n, .. } if n == session)
    })
    .await;
    server.recv_command().await.unwrap();
    sleep(hold).await;
    server.close_all(1001, "maintenance");

    match wait_for_state(transitions, |s| {
        matches!(s, SupervisorState::BackingOff { .. })
    })
    .await
    {
        SupervisorState::BackingOff { attempt, delay, .. } => (attempt, delay),
        other => unreachable!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn stable_session_resets_backoff_short_one_escalates() {
    let mut server = MockFeedServer::start().await;
    let (sink, _received) = RecordingSink::new();

    let mut config = config();
    config.reconnect.jitter = 0.0;
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(400);
    config.reconnect.stability_window = Duration::from_millis(250);

    let handle = Monitor::new(&server.ws_url(), config, sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();

    let (attempt, delay) =
        close_session_after(&mut server, &mut transitions, 1, Duration::ZERO).await;
    assert_eq!(attempt, 1);
    assert!(delay < Duration::from_millis(60), "{delay:?}");

    let (attempt, delay) =
        close_session_after(&mut server, &mut transitions, 2, Duration::ZERO).await;
    assert_eq!(attempt, 2, "a short session must keep escalating");
    assert!(delay >= Duration::from_millis(100), "{delay:?}");

    // Outlives the stability window, so the next failure starts over.
    let (attempt, delay) =
        close_session_after(&mut server, &mut transitions, 3, Duration::from_millis(400)).await;
    assert_eq!(attempt, 1, "a stable session must reset the backoff");
    assert!(delay < Duration::from_millis(60), "{delay:?}");

    let (attempt, delay) =
        close_session_after(&mut server, &mut transitions, 4, Duration::ZERO).await;
    assert_eq!(attempt, 2);
    assert!(delay >= Duration::from_millis(100), "{delay:?}");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_does_not_wait_for_a_stalled_sink() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut entered) = StalledSink::new();

    let mut config = config();
    config.notify_timeout = Duration::from_secs(30);

    let handle = Monitor::new(&server.ws_url(), config, sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();
    server.recv_command().await.unwrap();

    server.send(&announcement_frame("slow", "Stuck in the sink"));
    timeout(WAIT, entered.recv()).await.unwrap().unwrap();

    let started = Instant::now();
    let stats = timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("shutdown must not wait out the notify timeout")
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.sink_failures, 0);

    let mut states = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        states.push(state);
    }
    assert!(
        !states
            .iter()
            .any(|s| matches!(s, SupervisorState::BackingOff { .. })),
        "cancellation is not a failure: {states:?}"
    );
    assert_eq!(states.last(), Some(&SupervisorState::Stopped));
}

#[tokio::test]
async fn duplicate_ids_are_suppressed_across_reconnects() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();
    server.recv_command().await.unwrap();

    server.send(&announcement_frame("a", "Once"));
    assert_eq!(next_announcement(&mut received).await.id, feed("a"));

    server.close_all(1000, "");
    wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::Running { session: 2, .. })
    })
    .await;
    server.recv_command().await.unwrap();

    server.send(&announcement_frame("a", "Once, replayed"));
    server.send(&announcement_frame("b", "Fresh"));
    assert_eq!(next_announcement(&mut received).await.id, feed("b"));

    let stats = handle.shutdown().await.unwrap();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.dispatched, 2);
}

#[tokio::test]
async fn unanswered_ping_triggers_reconnect() {
    let server = MockFeedServer::start().await;
    server.set_silent(true);

    let mut config = config();
    config.ping_interval = Duration::from_millis(100);
    config.liveness_timeout = Duration::from_millis(200);
    let (sink, _received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config, sink)
        .unwrap()
        .spawn();
    let mut transitions = handle.transitions();

    wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::Running { session: 1, .. })
    })
    .await;
    let backing_off = wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::BackingOff { .. })
    })
    .await;
    assert!(matches!(
        backing_off,
        SupervisorState::BackingOff {
            after: Failure::LivenessTimeout,
            ..
        }
    ));

    wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::Connecting { session: 2 })
    })
    .await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_during_backoff_stops_without_reconnecting() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/sapi/wss", listener.local_addr().unwrap());
    drop(listener);

    let mut config = config();
    config.reconnect.initial_backoff = Duration::from_secs(30);
    config.reconnect.max_backoff = Duration::from_secs(30);
    let (sink, _received) = RecordingSink::new();

    let handle = Monitor::new(&endpoint, config, sink).unwrap().spawn();
    let mut transitions = handle.transitions();

    let backing_off = wait_for_state(&mut transitions, |s| {
        matches!(s, SupervisorState::BackingOff { .. })
    })
    .await;
    assert!(matches!(
        backing_off,
        SupervisorState::BackingOff {
            attempt: 1,
            after: Failure::Connect,
            ..
        }
    ));

    timeout(WAIT, handle.shutdown())
        .await
        .expect("shutdown must not wait out the backoff")
        .unwrap();

    let mut after_shutdown = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        after_shutdown.push(state);
    }
    assert_eq!(after_shutdown, [SupervisorState::Stopped]);
}

#[tokio::test]
async fn run_returns_when_cancelled() {
    let mut server = MockFeedServer::start().await;
    let (sink, mut received) = RecordingSink::new();
    let shutdown = CancellationToken::new();

    let monitor = Monitor::new(&server.ws_url(), config(), sink).unwrap();
    let task = tokio::spawn(monitor.run(shutdown.clone()));

    server.recv_command().await.unwrap();
    server.send(&announcement_frame("x", "Before stop"));
    next_announcement(&mut received).await;

    shutdown.cancel();
    let stats = timeout(WAIT, task).await.unwrap().unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn dropping_the_handle_stops_the_monitor() {
    let mut server = MockFeedServer::start().await;
    let (sink, _received) = RecordingSink::new();

    let handle = Monitor::new(&server.ws_url(), config(), sink)
        .unwrap()
        .spawn();
    let mut state = handle.state_receiver();
    server.recv_command().await.unwrap();

    drop(handle);

    timeout(WAIT, state.wait_for(|s| s.is_stopped()))
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn non_websocket_endpoint_is_fatal() {
    let (sink, _received) = RecordingSink::new();

    let err = Monitor::new("http://localhost:8080/feed", config(), sink)
        .err()
        .unwrap();

    assert_eq!(err.kind(), Kind::Validation);
    assert!(matches!(
        err.downcast_ref::<WsError>(),
        Some(WsError::InvalidEndpoint(_))
    ));
}
