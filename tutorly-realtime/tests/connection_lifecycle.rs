//! Connection lifecycle driven through the in-memory transport.
//!
//! All tests run on a paused clock: backoff delays are crossed with
//! `tokio::time::advance`, never by sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tutorly_realtime::mock::MockTransportFactory;
use tutorly_realtime::{
    ClientConfig, ClientError, ConnectionState, RealtimeClient, ReconnectConfig, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const URL: &str = "ws://localhost:8000/ws/notifications/";

/// Let spawned pump and timer tasks run to quiescence.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

fn client_with(config: ClientConfig) -> (RealtimeClient, Arc<MockTransportFactory>) {
    let factory = MockTransportFactory::new();
    let client = RealtimeClient::with_transport(config, factory.clone()).unwrap();
    (client, factory)
}

fn client() -> (RealtimeClient, Arc<MockTransportFactory>) {
    client_with(ClientConfig::new(URL))
}

/// Connect and confirm the handshake on the first transport.
async fn open_client() -> (RealtimeClient, Arc<MockTransportFactory>) {
    let (client, factory) = client();
    client.connect();
    factory.latest().unwrap().open();
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Open);
    (client, factory)
}

fn collect_errors(client: &RealtimeClient) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    client.on_error(move |e| sink.lock().unwrap().push(e.to_string()));
    errors
}

// ─── Delivery ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_balance_update_delivered_once() {
    let (client, factory) = open_client().await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    client.subscribe("balance_update", move |data| sink.lock().unwrap().push(data.clone()));

    factory
        .latest()
        .unwrap()
        .message(r#"{"type":"balance_update","data":{"balance":{"current_balance":42}}}"#);
    settle().await;

    let received = received.lock().unwrap();
    assert_eq!(*received, vec![json!({"balance": {"current_balance": 42}})]);
}

#[tokio::test(start_paused = true)]
async fn test_messages_arrive_in_order() {
    let (client, factory) = open_client().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.subscribe("lesson_created", move |data| {
        sink.lock().unwrap().push(data["id"].as_i64().unwrap())
    });

    let conn = factory.latest().unwrap();
    for id in 0..20 {
        conn.message(json!({"type": "lesson_created", "data": {"id": id}}).to_string());
    }
    settle().await;

    assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_not_dispatched() {
    let (client, factory) = open_client().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.subscribe_all(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let conn = factory.latest().unwrap();
    conn.message("not json at all");
    conn.message(r#"{"data":{}}"#);
    conn.message(r#"["balance_update"]"#);
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(client.last_message().is_none());
    assert_eq!(client.connection_state(), ConnectionState::Open);

    // The connection keeps working afterwards
    conn.message(r#"{"type":"chat_message","data":{"text":"hi"}}"#);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_last_message_tracks_latest_envelope() {
    let (client, factory) = open_client().await;
    let mut messages = client.watch_messages();

    let conn = factory.latest().unwrap();
    conn.message(r#"{"type":"lesson_updated","data":{"id":1}}"#);
    conn.message(
        r#"{"type":"balance_update","data":{"current_balance":7},"timestamp":"2024-05-01T10:00:00Z","user_id":12}"#,
    );
    settle().await;

    let last = client.last_message().unwrap();
    assert_eq!(last.message_type, "balance_update");
    assert_eq!(last.user_id, Some(12));
    assert_eq!(last.timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));

    assert!(messages.has_changed().unwrap());
    let seen = messages.borrow_and_update().clone().unwrap();
    assert_eq!(seen.message_type, "balance_update");
}

// ─── Sending ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_send_json_round_trip() {
    let (client, factory) = open_client().await;

    client.send_json(&json!({"a": 1}));
    client.send("raw text");

    assert_eq!(factory.latest().unwrap().sent(), vec![r#"{"a":1}"#, "raw text"]);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_not_open_is_dropped() {
    let (client, factory) = client();

    // Idle: no transport at all
    client.send("early");
    assert_eq!(factory.open_count(), 0);

    client.connect();
    client.send("still connecting");
    let conn = factory.latest().unwrap();
    assert!(conn.sent().is_empty());

    conn.open();
    settle().await;
    client.send("now");
    assert_eq!(conn.sent(), vec!["now"]);
}

// ─── Connect / disconnect ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_connect_is_noop_while_active() {
    let (client, factory) = client();

    client.connect();
    client.connect();
    assert_eq!(factory.open_count(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Connecting);

    factory.latest().unwrap().open();
    settle().await;
    client.connect();
    assert_eq!(factory.open_count(), 1);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_open() {
    let (client, factory) = open_client().await;

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Closing);
    assert_eq!(
        factory.latest().unwrap().close_request(),
        Some((NORMAL_CLOSURE, "client disconnect".to_string()))
    );

    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(client.reconnect_attempt().is_none());

    advance(60_000).await;
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_local_close_with_custom_code_not_reconnected() {
    let (client, factory) = open_client().await;

    client.disconnect_with(4000, "logged out");
    settle().await;

    assert_eq!(client.connection_state(), ConnectionState::Closed);
    advance(60_000).await;
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closing_waits_for_confirmation() {
    let factory = MockTransportFactory::without_close_echo();
    let client = RealtimeClient::with_transport(ClientConfig::new(URL), factory.clone()).unwrap();
    client.connect();
    let conn = factory.latest().unwrap();
    conn.open();
    settle().await;

    client.disconnect();
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Closing);

    // The confirmation carries whatever code the server chose; still local
    conn.close(ABNORMAL_CLOSURE, "");
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(client.reconnect_attempt().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_closing_opens_fresh_transport() {
    let factory = MockTransportFactory::without_close_echo();
    let client = RealtimeClient::with_transport(ClientConfig::new(URL), factory.clone()).unwrap();
    client.connect();
    let silent = factory.latest().unwrap();
    silent.open();
    settle().await;

    // The server never confirms this close
    client.disconnect();
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Closing);

    client.connect();
    settle().await;
    assert_eq!(factory.open_count(), 2);
    assert_eq!(client.connection_state(), ConnectionState::Connecting);
    assert!(!silent.is_listened());

    let fresh = factory.latest().unwrap();
    fresh.open();
    settle().await;
    assert!(client.is_connected());

    // A very late echo from the old socket is ignored
    silent.close(NORMAL_CLOSURE, "");
    settle().await;
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_remote_normal_close_not_reconnected() {
    let (client, factory) = open_client().await;

    factory.latest().unwrap().close(NORMAL_CLOSURE, "server shutdown");
    settle().await;

    assert_eq!(client.connection_state(), ConnectionState::Closed);
    advance(60_000).await;
    assert_eq!(factory.open_count(), 1);
}

// ─── Reconnect ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_until_failed() {
    let (client, factory) = client();
    let errors = collect_errors(&client);

    client.connect();
    factory.latest().unwrap().open();
    settle().await;
    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "network lost");
    settle().await;

    for (n, expected) in [1000u64, 2000, 4000, 8000, 16000].into_iter().enumerate() {
        let pending = client.reconnect_attempt().unwrap();
        assert_eq!(pending.attempt_number, n as u32);
        assert_eq!(pending.delay, Duration::from_millis(expected));
        assert_eq!(pending.close_code, ABNORMAL_CLOSURE);
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        let opens = factory.open_count();
        advance(expected - 10).await;
        assert_eq!(factory.open_count(), opens, "fired early at attempt {n}");
        advance(20).await;
        assert_eq!(factory.open_count(), opens + 1, "did not fire at attempt {n}");

        // The new transport fails before its handshake completes
        factory.latest().unwrap().close(ABNORMAL_CLOSURE, "refused");
        settle().await;
    }

    assert_eq!(client.connection_state(), ConnectionState::Failed);
    assert!(client.reconnect_attempt().is_none());

    advance(120_000).await;
    assert_eq!(factory.open_count(), 6, "no sixth reconnect");

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("5 attempts"), "{}", errors[0]);
}

#[tokio::test(start_paused = true)]
async fn test_jittered_delay_stays_in_window() {
    let config = ClientConfig::new(URL).with_reconnect(ReconnectConfig {
        jitter_factor: 0.2,
        ..ReconnectConfig::default()
    });

    for _ in 0..10 {
        let (client, factory) = client_with(config.clone());
        client.connect();
        factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
        settle().await;

        let delay = client.reconnect_attempt().unwrap().delay;
        assert!(
            delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200),
            "{delay:?} outside 1000ms +/- 20%"
        );

        let whole_ms = delay.as_millis() as u64;
        advance(whole_ms - 1).await;
        assert_eq!(factory.open_count(), 1, "fired before {delay:?}");
        advance(2).await;
        assert_eq!(factory.open_count(), 2, "not fired by {delay:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_attempt_counter_resets_on_open() {
    let (client, factory) = open_client().await;

    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    advance(1_001).await;
    assert_eq!(factory.open_count(), 2);
    assert_eq!(client.manager().attempt(), 1);

    factory.latest().unwrap().open();
    settle().await;
    assert!(client.is_connected());
    assert_eq!(client.manager().attempt(), 0);

    factory.latest().unwrap().close(1011, "internal error");
    settle().await;
    let pending = client.reconnect_attempt().unwrap();
    assert_eq!(pending.attempt_number, 0);
    assert_eq!(pending.delay, Duration::from_millis(1000));
    assert_eq!(pending.close_reason, "internal error");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_timer() {
    let (client, factory) = open_client().await;

    factory.latest().unwrap().fail("connection reset");
    settle().await;
    assert!(client.reconnect_attempt().is_some());

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(client.reconnect_attempt().is_none());

    advance(60_000).await;
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_after_failed_starts_new_episode() {
    let config = ClientConfig::new(URL).with_reconnect(ReconnectConfig {
        max_attempts: 1,
        ..ReconnectConfig::default()
    });
    let (client, factory) = client_with(config);
    let errors = collect_errors(&client);

    client.connect();
    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    advance(1_001).await;
    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Failed);
    assert_eq!(errors.lock().unwrap().len(), 1);

    client.connect();
    assert_eq!(factory.open_count(), 3);
    assert_eq!(client.connection_state(), ConnectionState::Connecting);

    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    let pending = client.reconnect_attempt().unwrap();
    assert_eq!(pending.attempt_number, 0);
    assert_eq!(pending.delay, Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_stale_transport_events_ignored() {
    let (client, factory) = open_client().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.subscribe_all(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let old = factory.latest().unwrap();
    old.close(ABNORMAL_CLOSURE, "");
    settle().await;
    advance(1_001).await;
    let current = factory.latest().unwrap();
    assert_eq!(factory.open_count(), 2);
    assert!(!old.is_listened());
    assert!(current.is_listened());

    // Late traffic from the retired socket changes nothing
    old.open();
    old.message(r#"{"type":"chat_message","data":{}}"#);
    old.close(ABNORMAL_CLOSURE, "");
    settle().await;
    assert_eq!(client.connection_state(), ConnectionState::Connecting);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(client.reconnect_attempt().is_none());

    current.open();
    settle().await;
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_set_token_used_on_reconnect() {
    let (client, factory) = client_with(ClientConfig::new(URL).with_token("first"));

    client.connect();
    assert_eq!(
        factory.latest().unwrap().url(),
        "ws://localhost:8000/ws/notifications/?token=first"
    );

    client.set_token("second");
    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    advance(1_001).await;
    assert_eq!(
        factory.latest().unwrap().url(),
        "ws://localhost:8000/ws/notifications/?token=second"
    );

    client.clear_token();
    factory.latest().unwrap().close(ABNORMAL_CLOSURE, "");
    settle().await;
    advance(2_001).await;
    assert_eq!(factory.latest().unwrap().url(), URL);
}

// ─── Errors and state observation ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_transport_error_reported() {
    let (client, factory) = open_client().await;
    let errors = collect_errors(&client);

    factory.latest().unwrap().error("broken pipe");
    settle().await;

    assert_eq!(*errors.lock().unwrap(), vec!["Transport error: broken pipe".to_string()]);
    // An error alone does not change state; the close does
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_error_handler_isolated() {
    let config = ClientConfig::new(URL).with_reconnect(ReconnectConfig {
        max_attempts: 0,
        ..ReconnectConfig::default()
    });
    let (client, factory) = client_with(config);
    client.on_error(|_: &ClientError| panic!("handler bug"));

    client.connect();
    factory.latest().unwrap().fail("refused");
    settle().await;

    assert_eq!(client.connection_state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_watch_state_sequence() {
    let (client, factory) = client();
    let mut states = client.watch_state();
    assert_eq!(*states.borrow(), ConnectionState::Idle);

    client.connect();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

    factory.latest().unwrap().open();
    settle().await;
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Open);

    client.disconnect();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closing);
    settle().await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
}
