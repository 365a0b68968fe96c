//! Push path: create a command and hand it to the target's socket if one is
//! open. Anything not pushed stays `pending` for the poll path.

use std::sync::Arc;

use serde::Serialize;

use crate::command::{Command, CommandStatus, NewCommand};
use crate::protocol::GatewayFrame;
use crate::registry::ConnectionRegistry;
use crate::store::{CommandStore, IncidentStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Handed to the agent's open socket.
    Sent,
    /// No open socket; left pending for polling.
    Offline,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Sent => "sent",
            Delivery::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub command: Command,
    pub delivery: Delivery,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    commands: Arc<dyn CommandStore>,
    incidents: Arc<dyn IncidentStore>,
}

impl Dispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        commands: Arc<dyn CommandStore>,
        incidents: Arc<dyn IncidentStore>,
    ) -> Self {
        Self {
            registry,
            commands,
            incidents,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Persist the command as `pending`, then try to push it.
    ///
    /// Only a failure to persist is an error. An offline agent or a failed
    /// push leaves the command pending and reports [`Delivery::Offline`].
    pub fn submit(&self, new: NewCommand) -> Result<Submission, StoreError> {
        if let Some(incident_id) = &new.incident_id {
            self.incidents.ensure_incident(incident_id)?;
        }

        let mut command = self.commands.insert_command(new, CommandStatus::Pending)?;

        let frame = GatewayFrame::command(&command);
        match self.registry.push(&command.target_agent_id, frame) {
            Ok(()) => {
                match self.commands.mark_sent(&command.id) {
                    Ok(true) => {
                        command.status = CommandStatus::Sent;
                        command.sent_at = Some(chrono::Utc::now());
                    }
                    Ok(false) => {
                        // A poll or a fast result got there first.
                        tracing::debug!(command_id = %command.id, "command left pending state before push was recorded");
                    }
                    Err(e) => {
                        tracing::warn!(command_id = %command.id, error = %e, "pushed command but failed to mark it sent");
                    }
                }
                tracing::info!(
                    command_id = %command.id,
                    agent_id = %command.target_agent_id,
                    command_type = %command.command_type,
                    "command pushed"
                );
                Ok(Submission {
                    command,
                    delivery: Delivery::Sent,
                })
            }
            Err(reason) => {
                tracing::info!(
                    command_id = %command.id,
                    agent_id = %command.target_agent_id,
                    reason = %reason,
                    "agent offline, command queued for polling"
                );
                Ok(Submission {
                    command,
                    delivery: Delivery::Offline,
                })
            }
        }
    }
}
