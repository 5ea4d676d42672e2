//! Integration tests for the spread monitoring server.
//!
//! These drive the subscriber transport end-to-end over a real WebSocket
//! and exercise the snapshot/history pipeline against an in-memory store.
//! Run with: `cargo test --test integration_tests`

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use spreadwatch::{
    build_observation, unix_now, ConnectionManager, HistoryWriter, LatestSnapshot, Observation,
    Store, TokenConfig, WsServer,
};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(
    manager: Arc<ConnectionManager>,
    snapshot: Arc<LatestSnapshot>,
) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Arc::new(WsServer::new(manager, snapshot));
    tokio::spawn(async move {
        server.serve(listener, shutdown_rx).await.unwrap();
    });
    (addr, shutdown_tx)
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .unwrap();
    stream
}

async fn send_frame(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn recv_frame(ws: &mut WsStream) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("read ok");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

fn observation(token: &str, dex_price: f64, timestamp: f64) -> Observation {
    build_observation(
        token,
        Some(1.00),
        Some(1.02),
        Some(25.0),
        &[("jupiter", dex_price)],
        timestamp,
    )
}

#[tokio::test]
async fn test_subscribe_receives_ack_initial_data_and_updates() {
    let manager = Arc::new(ConnectionManager::new());
    let snapshot = Arc::new(LatestSnapshot::new());
    snapshot.insert(observation("X-USDT", 1.01, 42.0));
    let (addr, _shutdown) = start_server(Arc::clone(&manager), Arc::clone(&snapshot)).await;

    let mut ws = connect(addr).await;
    send_frame(
        &mut ws,
        json!({"type": "subscribe", "payload": {"tokens": ["X-USDT"]}}),
    )
    .await;

    let ack = recv_frame(&mut ws).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["payload"]["tokens"][0], "X-USDT");

    let initial = recv_frame(&mut ws).await;
    assert_eq!(initial["type"], "initial_data");
    assert_eq!(initial["payload"]["X-USDT"]["mexc_price"][0], 1.00);
    assert_eq!(initial["payload"]["X-USDT"]["mexc_limit"], 25.0);

    // A live delivery follows the scheduler's completion.
    manager.deliver("X-USDT", &observation("X-USDT", 1.013, 43.0));
    let data = recv_frame(&mut ws).await;
    assert_eq!(data["type"], "data");
    assert_eq!(
        data["payload"]["X-USDT"]["spreads"]["jupiter"]["dex_price"],
        1.013
    );
}

#[tokio::test]
async fn test_explicit_and_all_subscribers_are_filtered_independently() {
    let manager = Arc::new(ConnectionManager::new());
    let snapshot = Arc::new(LatestSnapshot::new());
    let (addr, _shutdown) = start_server(Arc::clone(&manager), snapshot).await;

    // A subscribes to one token, B to everything.
    let mut ws_a = connect(addr).await;
    send_frame(
        &mut ws_a,
        json!({"type": "subscribe", "payload": {"tokens": ["X-USDT"]}}),
    )
    .await;
    recv_frame(&mut ws_a).await; // subscribed
    recv_frame(&mut ws_a).await; // initial_data (empty)

    let mut ws_b = connect(addr).await;
    send_frame(&mut ws_b, json!({"type": "subscribe_all"})).await;
    let ack = recv_frame(&mut ws_b).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["payload"]["all"], true);

    manager.deliver("X-USDT", &observation("X-USDT", 1.01, 1.0));
    manager.deliver("Y-USDT", &observation("Y-USDT", 2.02, 1.0));

    // B sees one envelope per token, in delivery order.
    let first = recv_frame(&mut ws_b).await;
    assert!(first["payload"].get("X-USDT").is_some());
    let second = recv_frame(&mut ws_b).await;
    assert!(second["payload"].get("Y-USDT").is_some());

    // A sees only its own token.
    let only = recv_frame(&mut ws_a).await;
    assert!(only["payload"].get("X-USDT").is_some());
    assert!(only["payload"].get("Y-USDT").is_none());
}

#[tokio::test]
async fn test_ping_and_malformed_frames() {
    let manager = Arc::new(ConnectionManager::new());
    let snapshot = Arc::new(LatestSnapshot::new());
    let (addr, _shutdown) = start_server(manager, snapshot).await;

    let mut ws = connect(addr).await;
    send_frame(&mut ws, json!({"type": "ping"})).await;
    let pong = recv_frame(&mut ws).await;
    assert_eq!(pong["type"], "pong");

    ws.send(Message::Text("{broken".to_string())).await.unwrap();
    let error = recv_frame(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["message"], "Invalid JSON");
}

#[tokio::test]
async fn test_shutdown_closes_transports_and_refuses_new_subscribers() {
    let manager = Arc::new(ConnectionManager::new());
    let snapshot = Arc::new(LatestSnapshot::new());
    let (addr, shutdown) = start_server(Arc::clone(&manager), snapshot).await;

    let mut ws = connect(addr).await;
    send_frame(&mut ws, json!({"type": "ping"})).await;
    recv_frame(&mut ws).await;

    shutdown.send(true).unwrap();
    // The outbound channel closes and the socket is shut cleanly.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn test_history_pipeline_coalesces_flushes_and_prunes() {
    let store = Store::open_in_memory().unwrap();
    store
        .insert_token(&TokenConfig {
            name: "X-USDT".to_string(),
            base: "X".to_string(),
            quote: "USDT".to_string(),
            is_active: true,
            ..Default::default()
        })
        .unwrap();
    let writer = HistoryWriter::new(store.clone(), 48, Duration::from_secs(5));

    // Two observations inside one flush window coalesce to the latest.
    let now = unix_now();
    writer.enqueue(observation("X-USDT", 1.01, now - 1.0));
    writer.enqueue(observation("X-USDT", 1.02, now));
    writer.flush();
    assert_eq!(store.history_row_count().unwrap(), 1);

    // A fresh row survives the prune; an ancient one does not.
    writer.enqueue(observation("X-USDT", 1.03, now - 49.0 * 3600.0));
    writer.flush();
    assert_eq!(store.history_row_count().unwrap(), 2);
    writer.prune();
    assert_eq!(store.history_row_count().unwrap(), 1);
}
