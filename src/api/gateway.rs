//! Agent WebSocket sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};

use crate::protocol::{AgentFrame, GatewayFrame};
use crate::registry::ChannelHandle;

use super::error::ApiError;
use super::AppState;

/// Holds one slot of the agent socket cap until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let current = counter.fetch_add(1, Ordering::AcqRel);
        if current >= max {
            counter.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(Self(counter.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

pub(super) async fn agent_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let slot = ConnectionSlot::acquire(&state.agent_sockets, state.max_connections).ok_or_else(|| {
        tracing::warn!(max = state.max_connections, "agent socket limit reached, refusing upgrade");
        ApiError::TooManyConnections
    })?;
    Ok(ws.on_upgrade(move |socket| handle_agent_socket(socket, state, slot)))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_frame(ws_tx: &mut WsSink, frame: &GatewayFrame) -> bool {
    match frame.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode gateway frame");
            true
        }
    }
}

async fn send_close(ws_tx: &mut WsSink, reason: &'static str) {
    let close_frame = CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_agent_socket(socket: WebSocket, state: AppState, _slot: ConnectionSlot) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (channel, mut outbound) = ChannelHandle::new();
    let connection_id = channel.id();
    let closed = channel.closed();
    let shutdown = state.shutdown.clone();

    // Set by the first register frame. Until then the socket has no registry
    // entry for the reaper to find, so it gets its own deadline.
    let mut agent_id: Option<String> = None;
    let register_deadline = tokio::time::sleep(state.register_timeout);
    tokio::pin!(register_deadline);

    loop {
        tokio::select! {
            // Pushed commands -> agent
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if !send_frame(&mut ws_tx, &frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_agent_frame(&state, &channel, &mut agent_id, text.as_str());
                        if let Some(reply) = reply {
                            if !send_frame(&mut ws_tx, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(connection_id, error = %e, "agent socket error");
                        break;
                    }
                }
            }

            _ = &mut register_deadline, if agent_id.is_none() => {
                tracing::debug!(connection_id, "agent socket never registered, closing");
                send_close(&mut ws_tx, "register timeout").await;
                break;
            }

            _ = closed.cancelled() => {
                tracing::debug!(connection_id, "registry closed agent connection");
                send_close(&mut ws_tx, "connection closed by gateway").await;
                break;
            }

            _ = shutdown.cancelled() => {
                tracing::debug!(connection_id, "agent socket received shutdown signal, closing");
                send_close(&mut ws_tx, "server shutting down").await;
                break;
            }
        }
    }

    if let Some(id) = agent_id {
        if state.registry.remove(&id, connection_id) {
            tracing::info!(agent_id = %id, connection_id, "agent disconnected");
        }
    }
}

/// Apply one text frame from an agent. Returns the reply to send, if any.
fn handle_agent_frame(
    state: &AppState,
    channel: &ChannelHandle,
    agent_id: &mut Option<String>,
    text: &str,
) -> Option<GatewayFrame> {
    let frame = match serde_json::from_str::<AgentFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "malformed agent frame");
            return Some(GatewayFrame::error(format!("invalid frame: {}", e)));
        }
    };

    match frame {
        AgentFrame::Register { agent_id: id } => {
            if id.trim().is_empty() {
                return Some(GatewayFrame::error("agent_id must not be empty"));
            }
            if let Some(previous) = agent_id.as_deref() {
                if previous != id {
                    state.registry.remove(previous, channel.id());
                }
            }
            let replaced = state.registry.register(&id, channel.clone());
            tracing::info!(agent_id = %id, connection_id = channel.id(), replaced, "agent registered");
            let reply = GatewayFrame::registered(&id);
            *agent_id = Some(id);
            Some(reply)
        }
        AgentFrame::Ping => {
            if let Some(id) = agent_id.as_deref() {
                if !state.registry.heartbeat(id) {
                    tracing::debug!(agent_id = %id, "heartbeat from agent with no registry entry");
                }
            }
            Some(GatewayFrame::pong())
        }
        AgentFrame::CommandResponse { command_id } => {
            tracing::debug!(
                agent_id = agent_id.as_deref().unwrap_or("-"),
                command_id = command_id.as_deref().unwrap_or("-"),
                "command acknowledged over socket"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cap_enforced_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).unwrap();
        let _second = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert!(ConnectionSlot::acquire(&counter, 2).is_some());
    }
}
