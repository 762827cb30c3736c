use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use protocol::widget_key;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::WebSocketStream;

type RelaySocket = WebSocketStream<TcpStream>;

const INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// FAKE RELAY
// =============================================================================

/// Loopback websocket listener that hands each accepted socket to the test.
struct FakeRelay {
    url: String,
    accepted: Arc<AtomicUsize>,
    sockets: mpsc::UnboundedReceiver<RelaySocket>,
}

impl FakeRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let url = format!("ws://{}", listener.local_addr().expect("local addr"));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, sockets) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });

        Self { url, accepted, sockets }
    }

    async fn next_socket(&mut self) -> RelaySocket {
        timeout(Duration::from_secs(2), self.sockets.recv())
            .await
            .expect("no connection attempt arrived")
            .expect("listener stopped")
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Listener that accepts TCP and hangs up before the websocket handshake.
async fn refusing_relay() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(tcp);
        }
    });
    (url, accepted)
}

/// Listener that accepts TCP and waits `delay` before the websocket handshake.
async fn slow_handshake_relay(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = tokio_tungstenite::accept_async(tcp).await;
            });
        }
    });
    (url, accepted)
}

// =============================================================================
// HELPERS
// =============================================================================

fn session_for(url: &str) -> SyncSession {
    SyncSession::new(SyncConfig::new(url).with_reconnect_interval(INTERVAL))
}

fn record_connection(session: &SyncSession) -> mpsc::UnboundedReceiver<bool> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.on_connection_change(move |connected| {
        let _ = tx.send(connected);
    });
    rx
}

async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event timed out")
        .expect("event channel closed")
}

async fn recv_client(ws: &mut RelaySocket) -> ClientMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("receive timed out")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return ClientMessage::decode(text.as_str()).expect("client sent undecodable text");
        }
    }
}

async fn push(ws: &mut RelaySocket, msg: &ServerMessage) {
    let text = msg.encode().expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send to client");
}

/// Connect `session` to `relay` and consume the opening `get_state`.
async fn open(session: &SyncSession, relay: &mut FakeRelay) -> RelaySocket {
    session.connect();
    let mut ws = relay.next_socket().await;
    assert_eq!(recv_client(&mut ws).await, ClientMessage::GetState);
    ws
}

async fn wait_for_phase(session: &SyncSession, phase: ConnectionPhase) {
    let mut rx = session.watch_phase();
    timeout(Duration::from_secs(2), rx.wait_for(|p| *p == phase))
        .await
        .expect("phase timed out")
        .expect("phase channel closed");
}

#[derive(Default)]
struct RecordingIndicator {
    states: Mutex<Vec<bool>>,
}

impl StatusIndicator for RecordingIndicator {
    fn set_connected(&self, connected: bool) {
        self.states.lock().expect("indicator lock").push(connected);
    }
}

/// Indicator that takes a while to show "disconnected".
#[derive(Default)]
struct SlowIndicator {
    states: Mutex<Vec<bool>>,
}

impl StatusIndicator for SlowIndicator {
    fn set_connected(&self, connected: bool) {
        if !connected {
            std::thread::sleep(Duration::from_millis(50));
        }
        self.states.lock().expect("indicator lock").push(connected);
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[tokio::test]
async fn send_without_connection_returns_false() {
    let session = SyncSession::new(SyncConfig::default());
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);
    assert!(!session.send(&ClientMessage::GetState));
    assert!(!session.broadcast_clock_change(1));
    assert!(!session.broadcast_parameter_change(1, "SIZE", json!(1.5)));
}

#[tokio::test]
async fn open_sends_get_state_first_and_reports_connected() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;

    assert!(next_event(&mut connection).await);
    wait_for_phase(&session, ConnectionPhase::Connected).await;
    assert!(session.is_connected());

    assert!(session.broadcast_parameter_change(2, "COLOR", json!(4)));
    assert_eq!(
        recv_client(&mut ws).await,
        ClientMessage::ParameterChange(ParameterChange::new(2, "COLOR", json!(4)))
    );
    assert!(session.broadcast_clock_change(3));
    assert_eq!(recv_client(&mut ws).await, ClientMessage::ClockChange(ClockChange { widget_index: 3 }));
}

#[tokio::test]
async fn messages_sent_while_down_are_not_replayed_after_reconnect() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);

    ws.close(None).await.expect("close from relay");
    assert!(!next_event(&mut connection).await);
    assert!(!session.broadcast_clock_change(7));
    assert!(!session.broadcast_parameter_change(0, "SIZE", json!(2.0)));

    let mut ws = relay.next_socket().await;
    assert_eq!(recv_client(&mut ws).await, ClientMessage::GetState);
    assert!(
        timeout(Duration::from_millis(200), ws.next()).await.is_err(),
        "nothing beyond get_state should arrive on the new connection"
    );
}

#[tokio::test]
async fn send_fails_once_the_relay_hangs_up() {
    let mut relay = FakeRelay::start().await;
    let session =
        SyncSession::new(SyncConfig::new(relay.url.as_str()).with_reconnect_interval(Duration::from_secs(30)));
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);
    ws.close(None).await.expect("close from relay");
    drop(ws);

    timeout(Duration::from_secs(2), async {
        while session.broadcast_clock_change(1) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("send kept succeeding after the relay hung up");
    for _ in 0..5 {
        assert!(!session.broadcast_clock_change(1));
        sleep(Duration::from_millis(5)).await;
    }

    assert!(!next_event(&mut connection).await);
    assert!(!session.send(&ClientMessage::GetState));
    assert_eq!(relay.accepted(), 1);
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test]
async fn inbound_messages_reach_their_callbacks() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);

    let (clock_tx, mut clocks) = mpsc::unbounded_channel();
    session.on_clock_change(move |index| {
        let _ = clock_tx.send(index);
    });
    let (param_tx, mut params) = mpsc::unbounded_channel();
    session.on_parameter_change(move |change| {
        let _ = param_tx.send(change.clone());
    });
    let (state_tx, mut states) = mpsc::unbounded_channel();
    session.on_state_sync(move |state| {
        let _ = state_tx.send(state.clone());
    });

    let mut ws = open(&session, &mut relay).await;

    let mut snapshot = GlobalState { active_widget_index: 2, ..GlobalState::default() };
    snapshot
        .widget_settings
        .entry(widget_key(2))
        .or_default()
        .insert("FONT".into(), json!(1));
    push(&mut ws, &ServerMessage::StateSync(snapshot.clone())).await;
    push(&mut ws, &ServerMessage::ClockChange(ClockChange { widget_index: 5 })).await;
    let change = ParameterChange::new(5, "RENDERER", json!(1));
    push(&mut ws, &ServerMessage::ParameterChange(change.clone())).await;

    assert_eq!(next_event(&mut states).await, snapshot);
    assert_eq!(next_event(&mut clocks).await, 5);
    assert_eq!(next_event(&mut params).await, change);
}

#[tokio::test]
async fn unknown_and_malformed_inbound_is_ignored() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let (clock_tx, mut clocks) = mpsc::unbounded_channel();
    session.on_clock_change(move |index| {
        let _ = clock_tx.send(index);
    });

    let mut ws = open(&session, &mut relay).await;
    for text in ["nope", r#"{"type":"chat","data":{}}"#, r#"{"type":"clock_change","data":{}}"#] {
        ws.send(Message::Text(text.into())).await.expect("send garbage");
    }
    push(&mut ws, &ServerMessage::ClockChange(ClockChange { widget_index: 1 })).await;

    assert_eq!(next_event(&mut clocks).await, 1);
    assert!(clocks.try_recv().is_err());
    assert!(session.is_connected());
}

#[tokio::test]
async fn registering_a_callback_replaces_the_previous_one() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);

    let first_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first_calls);
    session.on_clock_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, mut second) = mpsc::unbounded_channel();
    session.on_clock_change(move |index| {
        let _ = tx.send(index);
    });

    let mut ws = open(&session, &mut relay).await;
    push(&mut ws, &ServerMessage::ClockChange(ClockChange { widget_index: 8 })).await;

    assert_eq!(next_event(&mut second).await, 8);
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// RECONNECT
// =============================================================================

#[tokio::test]
async fn server_close_triggers_exactly_one_reconnect() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);

    ws.close(None).await.expect("close from relay");
    assert!(!next_event(&mut connection).await);

    let mut ws = relay.next_socket().await;
    assert_eq!(recv_client(&mut ws).await, ClientMessage::GetState);
    assert!(next_event(&mut connection).await);

    sleep(INTERVAL * 3).await;
    assert_eq!(relay.accepted(), 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn failed_attempts_keep_retrying_on_the_interval() {
    let (url, accepted) = refusing_relay().await;
    let session = session_for(&url);
    let mut connection = record_connection(&session);

    session.connect();
    for _ in 0..3 {
        assert!(!next_event(&mut connection).await);
    }

    assert!(accepted.load(Ordering::SeqCst) >= 3);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn disconnect_while_connected_stops_reconnecting() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);

    session.disconnect();
    assert!(!next_event(&mut connection).await);
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay should observe the close");

    sleep(INTERVAL * 3).await;
    assert_eq!(relay.accepted(), 1);
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);
    assert!(!session.broadcast_clock_change(1));
}

#[tokio::test]
async fn disconnect_with_pending_timer_cancels_it() {
    let (url, accepted) = refusing_relay().await;
    let session = session_for(&url);
    let mut connection = record_connection(&session);

    session.connect();
    assert!(!next_event(&mut connection).await);
    session.disconnect();
    let attempts = accepted.load(Ordering::SeqCst);

    sleep(INTERVAL * 3).await;
    assert_eq!(accepted.load(Ordering::SeqCst), attempts);
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn disconnect_during_handshake_cancels_the_attempt() {
    let handshake_delay = Duration::from_millis(300);
    let (url, accepted) = slow_handshake_relay(handshake_delay).await;
    let session = session_for(&url);
    let mut connection = record_connection(&session);

    session.connect();
    timeout(Duration::from_secs(2), async {
        while accepted.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay never saw the attempt");
    assert_eq!(session.phase(), ConnectionPhase::Connecting);

    session.disconnect();
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);

    sleep(handshake_delay + INTERVAL * 3).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(session.phase(), ConnectionPhase::Disconnected);
    assert!(connection.try_recv().is_err(), "no connection change expected");
}

#[tokio::test]
async fn connect_after_disconnect_starts_a_new_run() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);

    let _first = open(&session, &mut relay).await;
    wait_for_phase(&session, ConnectionPhase::Connected).await;
    session.disconnect();

    let _second = open(&session, &mut relay).await;
    wait_for_phase(&session, ConnectionPhase::Connected).await;
    assert_eq!(relay.accepted(), 2);
}

#[tokio::test]
async fn dropping_the_session_closes_the_socket() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let mut ws = open(&session, &mut relay).await;
    wait_for_phase(&session, ConnectionPhase::Connected).await;

    drop(session);

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket should close after drop");
    sleep(INTERVAL * 3).await;
    assert_eq!(relay.accepted(), 1);
}

// =============================================================================
// INDICATOR
// =============================================================================

#[tokio::test]
async fn indicator_follows_every_transition() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let indicator = Arc::new(RecordingIndicator::default());
    session.set_indicator(indicator.clone());
    let mut connection = record_connection(&session);

    let mut ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);
    ws.close(None).await.expect("close from relay");
    assert!(!next_event(&mut connection).await);
    session.disconnect();

    let states = indicator.states.lock().expect("indicator lock").clone();
    // attach, connecting, connected, lost, disconnect
    assert_eq!(states, vec![false, false, true, false, false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_indicator_still_ends_on_the_current_phase() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let indicator = Arc::new(SlowIndicator::default());
    session.set_indicator(indicator.clone());
    let mut connection = record_connection(&session);

    let _ws = open(&session, &mut relay).await;
    assert!(next_event(&mut connection).await);
    wait_for_phase(&session, ConnectionPhase::Connected).await;

    let states = indicator.states.lock().expect("indicator lock").clone();
    // attach, connecting, connected
    assert_eq!(states, vec![false, false, true]);
    assert!(session.is_connected());
}

#[tokio::test]
async fn indicator_attached_while_connected_shows_connected() {
    let mut relay = FakeRelay::start().await;
    let session = session_for(&relay.url);
    let _ws = open(&session, &mut relay).await;
    wait_for_phase(&session, ConnectionPhase::Connected).await;

    let indicator = Arc::new(RecordingIndicator::default());
    session.set_indicator(indicator.clone());

    assert_eq!(*indicator.states.lock().expect("indicator lock"), vec![true]);
}
