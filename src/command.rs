//! Command model and lifecycle state machine.
//!
//! A command is created `pending`, moves to `sent` when it is handed to a
//! transport (push or poll), and ends in `completed` or `failed` once a result
//! is ingested. Fire-once captures that the agent performed on its own are
//! recorded directly as `executed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Fetch,
    TunnelFetch,
    Screenshot,
    Snapshot,
    Popup,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Fetch => "fetch",
            CommandType::TunnelFetch => "tunnel-fetch",
            CommandType::Screenshot => "screenshot",
            CommandType::Snapshot => "snapshot",
            CommandType::Popup => "popup",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(CommandType::Fetch),
            "tunnel-fetch" => Ok(CommandType::TunnelFetch),
            "screenshot" => Ok(CommandType::Screenshot),
            "snapshot" => Ok(CommandType::Snapshot),
            "popup" => Ok(CommandType::Popup),
            other => Err(format!("unknown command type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
    Executed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Executed => "executed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            CommandStatus::Pending => 0,
            CommandStatus::Sent => 1,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Executed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether a command currently in `self` may be moved to `next`.
    ///
    /// Status never moves backward. `completed` and `failed` may replace each
    /// other (a re-posted result wins), but `executed` is final and nothing
    /// ever moves into `pending`.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        match (self, next) {
            (CommandStatus::Executed, _) => false,
            (_, CommandStatus::Pending) => false,
            (CommandStatus::Sent, CommandStatus::Sent) => false,
            (_, CommandStatus::Executed) => false,
            (current, next) => next.rank() >= current.rank(),
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "sent" => Ok(CommandStatus::Sent),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "executed" => Ok(CommandStatus::Executed),
            other => Err(format!("unknown command status '{}'", other)),
        }
    }
}

/// A command row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub command_type: CommandType,
    pub target_agent_id: String,
    pub target_sub_resource: Option<String>,
    pub incident_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: Option<serde_json::Value>,
}

impl Command {
    /// The wire descriptor handed to an agent on either delivery path.
    pub fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor {
            command_id: self.id.clone(),
            command_type: self.command_type,
            target_sub_resource: self.target_sub_resource.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Producer input for a new command. The store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_type: CommandType,
    pub target_agent_id: String,
    pub target_sub_resource: Option<String>,
    pub incident_id: Option<String>,
    pub payload: serde_json::Value,
    /// Initial response summary; only set for commands recorded already done.
    pub response: Option<serde_json::Value>,
}

impl NewCommand {
    pub fn new(command_type: CommandType, target_agent_id: impl Into<String>) -> Self {
        Self {
            command_type,
            target_agent_id: target_agent_id.into(),
            target_sub_resource: None,
            incident_id: None,
            payload: serde_json::Value::Null,
            response: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_sub_resource(mut self, sub_resource: impl Into<String>) -> Self {
        self.target_sub_resource = Some(sub_resource.into());
        self
    }

    pub fn with_incident(mut self, incident_id: impl Into<String>) -> Self {
        self.incident_id = Some(incident_id.into());
        self
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Materialize the row with a fresh id in the given status.
    pub(crate) fn into_command(self, status: CommandStatus) -> Command {
        let now = Utc::now();
        Command {
            id: uuid::Uuid::new_v4().to_string(),
            command_type: self.command_type,
            target_agent_id: self.target_agent_id,
            target_sub_resource: self.target_sub_resource,
            incident_id: self.incident_id,
            payload: self.payload,
            status,
            created_at: now,
            sent_at: None,
            completed_at: if status.is_terminal() { Some(now) } else { None },
            response: self.response,
        }
    }
}

/// What an agent receives for each claimed or pushed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub command_id: String,
    pub command_type: CommandType,
    pub target_sub_resource: Option<String>,
    pub payload: serde_json::Value,
}
