use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use super::{CommandStore, IncidentStore, OutcomeUpdate, ResultRecord, StoreError};
use crate::command::{Command, CommandStatus, NewCommand};
use crate::incident::{Incident, SessionRefresh};

struct StoredCommand {
    /// Insertion order; breaks ties between equal `created_at` values.
    seq: u64,
    command: Command,
}

#[derive(Default)]
struct Inner {
    commands: HashMap<String, StoredCommand>,
    next_seq: u64,
    results: Vec<ResultRecord>,
    incidents: HashMap<String, Incident>,
}

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandStore for MemoryStore {
    fn insert_command(&self, new: NewCommand, status: CommandStatus) -> Result<Command, StoreError> {
        let command = new.into_command(status);
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.commands.insert(
            command.id.clone(),
            StoredCommand {
                seq,
                command: command.clone(),
            },
        );
        Ok(command)
    }

    fn get_command(&self, id: &str) -> Result<Option<Command>, StoreError> {
        Ok(self.inner.read().commands.get(id).map(|s| s.command.clone()))
    }

    fn mark_sent(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner.commands.get_mut(id) {
            Some(stored) if stored.command.status == CommandStatus::Pending => {
                stored.command.status = CommandStatus::Sent;
                stored.command.sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<Command>, StoreError> {
        let mut inner = self.inner.write();

        let mut eligible: Vec<(u64, String)> = inner
            .commands
            .values()
            .filter(|s| {
                s.command.status == CommandStatus::Pending && s.command.target_agent_id == agent_id
            })
            .map(|s| (s.seq, s.command.id.clone()))
            .collect();
        eligible.sort_unstable_by_key(|(seq, _)| *seq);
        eligible.truncate(limit);

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(stored) = inner.commands.get_mut(&id) {
                stored.command.status = CommandStatus::Sent;
                stored.command.sent_at = Some(now);
                claimed.push(stored.command.clone());
            }
        }
        Ok(claimed)
    }

    fn record_outcome(
        &self,
        id: &str,
        status: CommandStatus,
        response: serde_json::Value,
    ) -> Result<OutcomeUpdate, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.commands.get_mut(id) else {
            return Ok(OutcomeUpdate::Missing);
        };
        if !stored.command.status.can_transition_to(status) {
            return Ok(OutcomeUpdate::Rejected(stored.command.status));
        }
        stored.command.status = status;
        stored.command.response = Some(response);
        stored.command.completed_at = Some(Utc::now());
        Ok(OutcomeUpdate::Applied(stored.command.clone()))
    }

    fn insert_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        self.inner.write().results.push(result.clone());
        Ok(())
    }

    fn insert_executed(&self, new: NewCommand, mut result: ResultRecord) -> Result<Command, StoreError> {
        let command = new.into_command(CommandStatus::Executed);
        result.command_id = command.id.clone();

        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.commands.insert(
            command.id.clone(),
            StoredCommand {
                seq,
                command: command.clone(),
            },
        );
        inner.results.push(result);
        Ok(command)
    }

    fn results_for(&self, command_id: &str) -> Result<Vec<ResultRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .results
            .iter()
            .filter(|r| r.command_id == command_id)
            .cloned()
            .collect())
    }
}

impl IncidentStore for MemoryStore {
    fn ensure_incident(&self, id: &str) -> Result<Incident, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner
            .incidents
            .entry(id.to_string())
            .or_insert_with(|| Incident::new(id))
            .clone())
    }

    fn get_incident(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        Ok(self.inner.read().incidents.get(id).cloned())
    }

    fn refresh_session(&self, id: &str, refresh: SessionRefresh) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner.incidents.get_mut(id) {
            Some(incident) => {
                incident.apply(refresh);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
