#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cmdgate::api::{self, AppState, RouterConfig};
use cmdgate::config::GatewayConfig;
use cmdgate::store::MemoryStore;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsTx = futures::stream::SplitSink<WsStream, Message>;
pub type WsRx = futures::stream::SplitStream<WsStream>;

/// App state over a fresh in-memory store. The store is returned so tests can
/// inspect what the gateway wrote.
pub fn create_test_state(config: &GatewayConfig) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(config, store.clone(), store.clone());
    (state, store)
}

pub fn test_router(state: AppState) -> axum::Router {
    api::router(state, RouterConfig::default())
}

pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Receive the next text message and parse it as JSON.
pub async fn recv_json(ws: &mut WsRx) -> serde_json::Value {
    let deadline = Duration::from_secs(2);
    let msg = tokio::time::timeout(deadline, ws.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Like [`recv_json`] but returns None if nothing arrives within `wait`.
pub async fn try_recv_json(ws: &mut WsRx, wait: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(wait, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

/// Wait for the server to close the socket. Returns true on a close frame or
/// end of stream.
pub async fn expect_closed(ws: &mut WsRx, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

pub async fn send_json(tx: &mut WsTx, value: serde_json::Value) {
    tx.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Open a socket and complete the register handshake.
pub async fn connect_agent(addr: SocketAddr, agent_id: &str) -> (WsTx, WsRx) {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (mut tx, mut rx) = ws.split();
    send_json(&mut tx, serde_json::json!({"type": "register", "agent_id": agent_id})).await;
    let reply = recv_json(&mut rx).await;
    assert_eq!(reply["type"], "registered");
    assert_eq!(reply["agent_id"], agent_id);
    (tx, rx)
}

/// POST a JSON body through the router without a socket.
pub async fn post_json(
    app: &axum::Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

pub async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}
