//! Connection registry: agent id -> open push channel.
//!
//! Entries live only as long as the process. Each entry is keyed by agent id
//! in a sharded map, so operations on one agent serialize while different
//! agents never contend on the same lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::GatewayFrame;

/// Frames buffered per connection before pushes start failing.
pub const OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The sending half of one agent socket plus the means to close it.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u64,
    tx: mpsc::Sender<GatewayFrame>,
    close: CancellationToken,
}

impl ChannelHandle {
    /// Create a handle and the receiver its socket writer drains.
    pub fn new() -> (Self, mpsc::Receiver<GatewayFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            close: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when the registry wants this socket closed.
    pub fn closed(&self) -> CancellationToken {
        self.close.clone()
    }

    fn close(&self) {
        self.close.cancel();
    }
}

struct Entry {
    channel: ChannelHandle,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// No registry entry for the agent.
    NotConnected,
    /// The connection's outbound buffer is full.
    Backlogged,
    /// The socket writer has already gone away.
    Closed,
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "agent is not connected"),
            Self::Backlogged => write!(f, "agent outbound buffer is full"),
            Self::Closed => write!(f, "agent channel is closed"),
        }
    }
}

impl std::error::Error for PushError {}

/// A connected agent as reported by `GET /agents`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<String, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `agent_id`. A previous connection for
    /// the same agent is closed. Returns true if one was replaced.
    ///
    /// Registering the same connection twice only refreshes its heartbeat.
    pub fn register(&self, agent_id: &str, channel: ChannelHandle) -> bool {
        if let Some(mut entry) = self.inner.get_mut(agent_id) {
            if entry.channel.id == channel.id {
                entry.last_heartbeat = Instant::now();
                return false;
            }
        }

        let previous = self.inner.insert(
            agent_id.to_string(),
            Entry {
                channel,
                connected_at: Utc::now(),
                last_heartbeat: Instant::now(),
            },
        );
        match previous {
            Some(old) => {
                tracing::info!(agent_id = %agent_id, old_connection = old.channel.id, "agent re-registered, closing previous connection");
                old.channel.close();
                true
            }
            None => false,
        }
    }

    /// Refresh the heartbeat. Returns false if the agent has no entry.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        match self.inner.get_mut(agent_id) {
            Some(mut entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Hand a frame to the agent's socket writer without waiting.
    pub fn push(&self, agent_id: &str, frame: GatewayFrame) -> Result<(), PushError> {
        let entry = self.inner.get(agent_id).ok_or(PushError::NotConnected)?;
        entry.channel.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Remove the entry only if it still belongs to `connection_id`, so an
    /// older socket closing never drops a newer registration.
    pub fn remove(&self, agent_id: &str, connection_id: u64) -> bool {
        self.inner
            .remove_if(agent_id, |_, entry| entry.channel.id == connection_id)
            .is_some()
    }

    /// Evict and close every entry whose last heartbeat is older than
    /// `timeout`. Returns the evicted agent ids.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.inner.retain(|agent_id, entry| {
            if now.saturating_duration_since(entry.last_heartbeat) > timeout {
                entry.channel.close();
                evicted.push(agent_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.inner.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Connected agents, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentInfo> {
        let now = Instant::now();
        let mut agents: Vec<AgentInfo> = self
            .inner
            .iter()
            .map(|entry| AgentInfo {
                agent_id: entry.key().clone(),
                connected_at: entry.connected_at,
                idle_ms: now
                    .saturating_duration_since(entry.last_heartbeat)
                    .as_millis() as u64,
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Close every connection (server shutdown).
    pub fn close_all(&self) {
        for entry in self.inner.iter() {
            entry.channel.close();
        }
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let reg = ConnectionRegistry::new();
        let (handle, _rx) = ChannelHandle::new();
        assert!(!reg.register("agent-a", handle));
        assert!(reg.is_connected("agent-a"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregister_closes_previous() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = ChannelHandle::new();
        let first_closed = first.closed();
        let (second, _rx2) = ChannelHandle::new();
        reg.register("agent-a", first);
        assert!(reg.register("agent-a", second));
        assert!(first_closed.is_cancelled());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregister_same_connection_keeps_it_open() {
        let reg = ConnectionRegistry::new();
        let (handle, _rx) = ChannelHandle::new();
        let closed = handle.closed();
        reg.register("agent-a", handle.clone());
        assert!(!reg.register("agent-a", handle));
        assert!(!closed.is_cancelled());
        assert!(reg.is_connected("agent-a"));
    }

    #[test]
    fn heartbeat_unknown_agent_is_noop() {
        let reg = ConnectionRegistry::new();
        assert!(!reg.heartbeat("ghost"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn push_delivers_to_receiver() {
        let reg = ConnectionRegistry::new();
        let (handle, mut rx) = ChannelHandle::new();
        reg.register("agent-a", handle);
        reg.push("agent-a", GatewayFrame::pong()).unwrap();
        assert!(matches!(rx.recv().await, Some(GatewayFrame::Pong { .. })));
    }

    #[test]
    fn push_to_unknown_agent_fails() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.push("ghost", GatewayFrame::pong()), Err(PushError::NotConnected));
    }

    #[test]
    fn push_to_dropped_receiver_fails() {
        let reg = ConnectionRegistry::new();
        let (handle, rx) = ChannelHandle::new();
        reg.register("agent-a", handle);
        drop(rx);
        assert_eq!(reg.push("agent-a", GatewayFrame::pong()), Err(PushError::Closed));
    }

    #[test]
    fn push_to_full_buffer_fails() {
        let reg = ConnectionRegistry::new();
        let (handle, _rx) = ChannelHandle::new();
        reg.register("agent-a", handle);
        for _ in 0..OUTBOUND_CAPACITY {
            reg.push("agent-a", GatewayFrame::pong()).unwrap();
        }
        assert_eq!(reg.push("agent-a", GatewayFrame::pong()), Err(PushError::Backlogged));
    }

    #[test]
    fn remove_ignores_stale_connection_id() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = ChannelHandle::new();
        let first_id = first.id();
        let (second, _rx2) = ChannelHandle::new();
        let second_id = second.id();
        reg.register("agent-a", first);
        reg.register("agent-a", second);

        assert!(!reg.remove("agent-a", first_id));
        assert!(reg.is_connected("agent-a"));
        assert!(reg.remove("agent-a", second_id));
        assert!(!reg.is_connected("agent-a"));
    }

    #[test]
    fn evict_stale_closes_expired_entries() {
        let reg = ConnectionRegistry::new();
        let (handle, _rx) = ChannelHandle::new();
        let closed = handle.closed();
        reg.register("agent-a", handle);
        std::thread::sleep(Duration::from_millis(30));

        let (fresh, _rx2) = ChannelHandle::new();
        reg.register("agent-b", fresh);

        let evicted = reg.evict_stale(Duration::from_millis(15));
        assert_eq!(evicted, vec!["agent-a".to_string()]);
        assert!(closed.is_cancelled());
        assert!(!reg.is_connected("agent-a"));
        assert!(reg.is_connected("agent-b"));
    }

    #[test]
    fn heartbeat_keeps_entry_alive() {
        let reg = ConnectionRegistry::new();
        let (handle, _rx) = ChannelHandle::new();
        reg.register("agent-a", handle);
        std::thread::sleep(Duration::from_millis(30));
        assert!(reg.heartbeat("agent-a"));
        assert!(reg.evict_stale(Duration::from_millis(15)).is_empty());
        assert!(reg.is_connected("agent-a"));
    }

    #[test]
    fn snapshot_lists_agents_sorted() {
        let reg = ConnectionRegistry::new();
        for id in ["b", "a", "c"] {
            let (handle, rx) = ChannelHandle::new();
            std::mem::forget(rx);
            reg.register(id, handle);
        }
        let ids: Vec<_> = reg.snapshot().into_iter().map(|a| a.agent_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
