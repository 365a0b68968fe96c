use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::ConnectionRegistry;

/// One sweep: evict every connection silent for longer than `timeout`.
/// Returns the number evicted.
pub fn sweep(registry: &ConnectionRegistry, timeout: Duration) -> usize {
    let evicted = registry.evict_stale(timeout);
    for agent_id in &evicted {
        tracing::info!(agent_id = %agent_id, timeout_secs = timeout.as_secs(), "evicted stale connection");
    }
    evicted.len()
}

/// Spawn the periodic reaper. It stops when `shutdown` is cancelled.
pub fn spawn(
    registry: ConnectionRegistry,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip the first immediate tick.

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = sweep(&registry, timeout);
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = registry.len(), "reaper sweep done");
                    }
                }
            }
        }
    })
}
