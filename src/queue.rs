use std::sync::Arc;

use crate::command::CommandDescriptor;
use crate::store::{CommandStore, StoreError};

/// Pull path for agents without an open socket.
#[derive(Clone)]
pub struct PollQueue {
    commands: Arc<dyn CommandStore>,
    batch_limit: usize,
}

impl PollQueue {
    pub fn new(commands: Arc<dyn CommandStore>, batch_limit: usize) -> Self {
        Self {
            commands,
            batch_limit,
        }
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Claim the agent's oldest pending commands, at most `limit` (capped by
    /// the configured batch limit). Claimed commands are `sent` afterwards.
    pub fn fetch(&self, agent_id: &str, limit: Option<usize>) -> Result<Vec<CommandDescriptor>, StoreError> {
        let limit = limit.unwrap_or(self.batch_limit).min(self.batch_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.commands.claim_pending(agent_id, limit)?;
        if !claimed.is_empty() {
            tracing::info!(agent_id = %agent_id, count = claimed.len(), "commands claimed by poll");
        }
        Ok(claimed.iter().map(|c| c.descriptor()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandStatus, CommandType, NewCommand};
    use crate::store::MemoryStore;

    fn seed(store: &MemoryStore, agent: &str, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| {
                store
                    .insert_command(NewCommand::new(CommandType::Fetch, agent), CommandStatus::Pending)
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn default_limit_is_batch_limit() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, "agent-a", 15);
        let queue = PollQueue::new(store, 10);

        let first = queue.fetch("agent-a", None).unwrap();
        assert_eq!(first.len(), 10);
        let first_ids: Vec<_> = first.into_iter().map(|d| d.command_id).collect();
        assert_eq!(first_ids, ids[..10].to_vec());

        assert_eq!(queue.fetch("agent-a", None).unwrap().len(), 5);
        assert!(queue.fetch("agent-a", None).unwrap().is_empty());
    }

    #[test]
    fn requested_limit_is_capped() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "agent-a", 30);
        let queue = PollQueue::new(store, 10);
        assert_eq!(queue.fetch("agent-a", Some(50)).unwrap().len(), 10);
        assert_eq!(queue.fetch("agent-a", Some(3)).unwrap().len(), 3);
        assert!(queue.fetch("agent-a", Some(0)).unwrap().is_empty());
    }

    #[test]
    fn unknown_agent_gets_empty_batch() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "agent-a", 2);
        let queue = PollQueue::new(store, 10);
        assert!(queue.fetch("agent-z", None).unwrap().is_empty());
    }
}
