//! End-to-end socket tests: the real router on a loopback port, driven by
//! tokio-tungstenite clients.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use peer_relay::{ChatHistory, ChatMessage, Notification};

use crate::test_helpers::test_app_state;
use crate::ws::DIFF_WELCOME;
use crate::{AppState, build_router};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, AppState, tempfile::TempDir) {
    let (state, tmp) = test_app_state().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state, tmp)
}

async fn connect(addr: SocketAddr, path_and_query: &str) -> Client {
    let url = format!("ws://{addr}{path_and_query}");
    let (client, _) = timeout(TEST_TIMEOUT, tokio_tungstenite::connect_async(&url))
        .await
        .expect("timed out connecting")
        .expect("connect failed");
    client
}

async fn send(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("send failed");
}

/// Next notification, skipping control frames.
async fn next_notification(client: &mut Client) -> Notification {
    loop {
        let frame = timeout(TEST_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for notification")
            .expect("connection ended")
            .expect("read error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(_) => panic!("connection closed while waiting for notification"),
            _ => {}
        }
    }
}

async fn next_chat(client: &mut Client) -> ChatMessage {
    match next_notification(client).await {
        Notification::Chat { message } => message,
        other => panic!("expected chat notification, got {other:?}"),
    }
}

/// Read until the server closes, collecting notifications on the way.
async fn read_until_closed(client: &mut Client) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        let frame = timeout(TEST_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Text(text))) => seen.push(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return seen,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn two_users_in_one_chat_both_receive() {
    let (addr, _state, _tmp) = start_server().await;

    let mut a = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    let mut b = connect(addr, "/api/ws/chat?chat_id=C&user_id=B").await;
    assert_eq!(next_notification(&mut a).await, Notification::welcome("C"));
    assert_eq!(next_notification(&mut b).await, Notification::welcome("C"));

    send(&mut a, "hi").await;

    for client in [&mut a, &mut b] {
        let msg = next_chat(client).await;
        assert_eq!(msg.payload, "hi");
        assert_eq!(msg.sender_id, "A");
        assert_eq!(msg.chat_id, "C");
    }
}

#[tokio::test]
async fn messages_are_persisted_to_history() {
    let (addr, state, _tmp) = start_server().await;

    let mut a = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    next_notification(&mut a).await;
    send(&mut a, "kept").await;
    next_chat(&mut a).await;

    let saved = state.history.fetch_updates("C", "reader").await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].payload, "kept");
}

#[tokio::test]
async fn duplicate_user_gets_rejection_then_close() {
    let (addr, _state, _tmp) = start_server().await;

    let mut first = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    next_notification(&mut first).await;

    let mut second = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    assert_eq!(
        read_until_closed(&mut second).await,
        vec![Notification::name_taken()]
    );

    // Same user in a different chat is fine
    let mut elsewhere = connect(addr, "/api/ws/chat?chat_id=D&user_id=A").await;
    assert_eq!(next_notification(&mut elsewhere).await, Notification::welcome("D"));
}

#[tokio::test]
async fn user_can_rejoin_after_leaving() {
    let (addr, _state, _tmp) = start_server().await;

    let mut first = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    next_notification(&mut first).await;
    first.close(None).await.unwrap();
    read_until_closed(&mut first).await;

    // Presence removal races the new connection; retry briefly
    let rejoined = timeout(TEST_TIMEOUT, async {
        loop {
            let mut again = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
            if next_notification(&mut again).await == Notification::welcome("C") {
                return again;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(rejoined.is_ok());
}

#[tokio::test]
async fn missing_params_are_rejected_before_upgrade() {
    let (addr, _state, _tmp) = start_server().await;

    for path in [
        "/api/ws/chat?user_id=A",
        "/api/ws/chat?chat_id=C&user_id=",
        "/api/ws/diff",
        "/api/ws/queue?chat_id=C",
    ] {
        let url = format!("ws://{addr}{path}");
        match tokio_tungstenite::connect_async(&url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
            }
            Err(e) => panic!("{path}: unexpected error {e}"),
            Ok(_) => panic!("{path}: upgrade should have been refused"),
        }
    }
}

#[tokio::test]
async fn diff_session_follows_watched_chats() {
    let (addr, _state, _tmp) = start_server().await;

    let mut watcher = connect(addr, "/api/ws/diff?user_id=W").await;
    assert_eq!(
        next_notification(&mut watcher).await,
        Notification::info(DIFF_WELCOME)
    );
    send(&mut watcher, r#"["C"]"#).await;
    assert_eq!(next_notification(&mut watcher).await, Notification::watching(1));

    let mut a = connect(addr, "/api/ws/chat?chat_id=C&user_id=A").await;
    next_notification(&mut a).await;
    send(&mut a, "seen by watcher").await;

    let msg = next_chat(&mut watcher).await;
    assert_eq!(msg.chat_id, "C");
    assert_eq!(msg.payload, "seen by watcher");
}

#[tokio::test]
async fn queue_endpoint_round_trips_through_history() {
    let (addr, state, _tmp) = start_server().await;
    let cancel = CancellationToken::new();
    let scanner = tokio::spawn(state.manager.clone().run(cancel.clone()));

    let mut client = connect(addr, "/api/ws/queue?chat_id=Q&user_id=A").await;
    assert_eq!(next_notification(&mut client).await, Notification::welcome("Q"));

    send(&mut client, "polled").await;
    let msg = next_chat(&mut client).await;
    assert_eq!(msg.payload, "polled");
    assert_eq!(msg.sender_id, "A");
    assert_eq!(state.manager.len().await, 1);

    cancel.cancel();
    scanner.await.unwrap();
}

#[tokio::test]
async fn health_and_metrics_routes() {
    let (state, _tmp) = test_app_state().await;
    let app = build_router(state);

    for uri in ["/health", "/health/live", "/health/ready", "/metrics"] {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{uri}");
    }
}
