//! End-to-end tests for the agent WebSocket endpoint: a real server on a
//! random port, agents connected with tokio-tungstenite, producers over HTTP.

mod common;

use std::time::Duration;

use cmdgate::command::CommandStatus;
use cmdgate::config::GatewayConfig;
use cmdgate::store::CommandStore;
use common::*;
use futures::SinkExt;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn submit(addr: std::net::SocketAddr, body: serde_json::Value) -> serde_json::Value {
    let resp = reqwest::Client::new()
        .post(format!("http://{}/commands", addr))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

async fn agent_count(addr: std::net::SocketAddr) -> u64 {
    let json: serde_json::Value = reqwest::get(format!("http://{}/agents", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    json["count"].as_u64().unwrap()
}

#[tokio::test]
async fn test_register_ping_and_malformed_frame() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;

    let (mut tx, mut rx) = connect_agent(addr, "agent-a").await;

    send_json(&mut tx, serde_json::json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut rx).await["type"], "pong");

    tx.send(Message::Text("not json at all".into())).await.unwrap();
    let err = recv_json(&mut rx).await;
    assert_eq!(err["type"], "error");
    assert!(err["error"].is_string());

    // The socket survives a bad frame.
    send_json(&mut tx, serde_json::json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut rx).await["type"], "pong");
    assert_eq!(agent_count(addr).await, 1);
}

#[tokio::test]
async fn test_machine_id_alias_registers() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;

    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (mut tx, mut rx) = futures::StreamExt::split(ws);
    send_json(&mut tx, serde_json::json!({"type": "register", "machine_id": "legacy-1"})).await;
    let reply = recv_json(&mut rx).await;
    assert_eq!(reply["type"], "registered");
    assert_eq!(reply["agent_id"], "legacy-1");
}

#[tokio::test]
async fn test_connected_agent_receives_push_and_poll_is_empty() {
    let (state, store) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;
    let (_tx, mut rx) = connect_agent(addr, "agent-a").await;

    let resp = submit(
        addr,
        serde_json::json!({
            "command_type": "fetch",
            "target_agent_id": "agent-a",
            "target_sub_resource": "tab-3",
            "payload": {"url": "https://example.com"},
        }),
    )
    .await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["status"], "sent");
    let id = resp["command_id"].as_str().unwrap().to_string();

    let frame = recv_json(&mut rx).await;
    assert_eq!(frame["type"], "command");
    assert_eq!(frame["command_id"], id.as_str());
    assert_eq!(frame["command_type"], "fetch");
    assert_eq!(frame["target_sub_resource"], "tab-3");
    assert_eq!(frame["payload"]["url"], "https://example.com");

    assert_eq!(store.get_command(&id).unwrap().unwrap().status, CommandStatus::Sent);

    let polled: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{}/commands/poll", addr))
        .json(&serde_json::json!({"agent_id": "agent-a"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(polled["commands"], serde_json::json!([]));
}

#[tokio::test]
async fn test_push_only_reaches_target_agent() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;
    let (_tx_a, mut rx_a) = connect_agent(addr, "agent-a").await;
    let (_tx_b, mut rx_b) = connect_agent(addr, "agent-b").await;

    submit(
        addr,
        serde_json::json!({"command_type": "snapshot", "target_agent_id": "agent-b"}),
    )
    .await;

    assert_eq!(recv_json(&mut rx_b).await["command_type"], "snapshot");
    assert!(try_recv_json(&mut rx_a, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_reregister_replaces_previous_socket() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;

    let (_old_tx, mut old_rx) = connect_agent(addr, "agent-a").await;
    let (_new_tx, mut new_rx) = connect_agent(addr, "agent-a").await;

    assert!(expect_closed(&mut old_rx, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent_count(addr).await, 1);

    let resp = submit(
        addr,
        serde_json::json!({"command_type": "fetch", "target_agent_id": "agent-a"}),
    )
    .await;
    assert_eq!(resp["status"], "sent");
    assert_eq!(recv_json(&mut new_rx).await["command_id"], resp["command_id"]);
}

#[tokio::test]
async fn test_disconnect_removes_agent_and_submit_goes_offline() {
    let (state, store) = create_test_state(&GatewayConfig::default());
    let addr = start_server(test_router(state)).await;

    let (mut tx, rx) = connect_agent(addr, "agent-a").await;
    assert_eq!(agent_count(addr).await, 1);

    tx.send(Message::Close(None)).await.unwrap();
    drop(tx);
    drop(rx);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent_count(addr).await, 0);

    let resp = submit(
        addr,
        serde_json::json!({"command_type": "fetch", "target_agent_id": "agent-a"}),
    )
    .await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["status"], "offline");
    let id = resp["command_id"].as_str().unwrap();
    assert_eq!(store.get_command(id).unwrap().unwrap().status, CommandStatus::Pending);
}

#[tokio::test]
async fn test_connection_cap_refuses_upgrade() {
    let mut config = GatewayConfig::default();
    config.server.max_connections = 1;
    let (state, _) = create_test_state(&config);
    let addr = start_server(test_router(state)).await;

    let (_tx, _rx) = connect_agent(addr, "agent-a").await;
    let second = connect_async(format!("ws://{}/ws", addr)).await;
    assert!(second.is_err(), "second socket should be refused at the cap");
}

#[tokio::test]
async fn test_shutdown_sends_close_frame() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let shutdown = state.shutdown.clone();
    let addr = start_server(test_router(state)).await;

    let (_tx, mut rx) = connect_agent(addr, "agent-a").await;
    shutdown.cancel();

    let msg = tokio::time::timeout(Duration::from_secs(2), futures::StreamExt::next(&mut rx))
        .await
        .expect("timeout waiting for close")
        .expect("stream ended without close frame")
        .expect("ws error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "server shutting down"),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_requires_token_when_configured() {
    let (state, _) = create_test_state(&GatewayConfig::default());
    let app = cmdgate::api::router(
        state,
        cmdgate::api::RouterConfig {
            token: Some("secret".into()),
            ..Default::default()
        },
    );
    let addr = start_server(app).await;

    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    assert!(connect_async(format!("ws://{}/ws?token=wrong", addr)).await.is_err());

    let (ws, _) = connect_async(format!("ws://{}/ws?token=secret", addr)).await.unwrap();
    let (mut tx, mut rx) = futures::StreamExt::split(ws);
    send_json(&mut tx, serde_json::json!({"type": "register", "agent_id": "agent-a"})).await;
    assert_eq!(recv_json(&mut rx).await["type"], "registered");
}

#[tokio::test]
async fn test_unregistered_socket_closed_and_slot_released() {
    let mut config = GatewayConfig::default();
    config.server.max_connections = 1;
    let (mut state, _) = create_test_state(&config);
    state.register_timeout = Duration::from_millis(100);
    let addr = start_server(test_router(state)).await;

    let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (_idle_tx, mut idle_rx) = futures::StreamExt::split(ws);

    let msg = tokio::time::timeout(Duration::from_secs(2), futures::StreamExt::next(&mut idle_rx))
        .await
        .expect("timeout waiting for close")
        .expect("stream ended without close frame")
        .expect("ws error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "register timeout"),
        other => panic!("expected close frame, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_tx, _rx) = connect_agent(addr, "agent-a").await;
    assert_eq!(agent_count(addr).await, 1);
}

#[tokio::test]
async fn test_registered_socket_outlives_register_deadline() {
    let (mut state, _) = create_test_state(&GatewayConfig::default());
    state.register_timeout = Duration::from_millis(100);
    let addr = start_server(test_router(state)).await;

    let (mut tx, mut rx) = connect_agent(addr, "agent-a").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    send_json(&mut tx, serde_json::json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut rx).await["type"], "pong");
    assert_eq!(agent_count(addr).await, 1);
}
