//! JSON frames exchanged with agents over the gateway WebSocket.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! ```text
//! agent   -> gateway   {"type":"register","agent_id":"..."}
//! gateway -> agent     {"type":"registered","agent_id":"...","timestamp":"..."}
//! agent   -> gateway   {"type":"ping"}
//! gateway -> agent     {"type":"pong","timestamp":"..."}
//! gateway -> agent     {"type":"command","command_id":"...","command_type":"fetch",...}
//! agent   -> gateway   {"type":"command_response","command_id":"..."}
//! gateway -> agent     {"type":"error","error":"..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandType};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Handshake. Older agents send `machine_id`.
    Register {
        #[serde(alias = "machine_id")]
        agent_id: String,
    },
    Ping,
    /// Informational acknowledgement; results arrive through ingestion.
    CommandResponse {
        #[serde(default)]
        command_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Registered {
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Command {
        command_id: String,
        command_type: CommandType,
        target_sub_resource: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
    },
}

impl GatewayFrame {
    pub fn registered(agent_id: &str) -> Self {
        GatewayFrame::Registered {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        GatewayFrame::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn command(command: &Command) -> Self {
        GatewayFrame::Command {
            command_id: command.id.clone(),
            command_type: command.command_type,
            target_sub_resource: command.target_sub_resource.clone(),
            payload: command.payload.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        GatewayFrame::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandStatus, NewCommand};
    use serde_json::json;

    #[test]
    fn parse_register() {
        let frame: AgentFrame =
            serde_json::from_value(json!({"type": "register", "agent_id": "a-1"})).unwrap();
        assert_eq!(frame, AgentFrame::Register { agent_id: "a-1".into() });
    }

    #[test]
    fn parse_register_with_machine_id() {
        let frame: AgentFrame =
            serde_json::from_value(json!({"type": "register", "machine_id": "m-9"})).unwrap();
        assert_eq!(frame, AgentFrame::Register { agent_id: "m-9".into() });
    }

    #[test]
    fn parse_ping_ignores_extra_fields() {
        let frame: AgentFrame =
            serde_json::from_value(json!({"type": "ping", "sent_at": 123})).unwrap();
        assert_eq!(frame, AgentFrame::Ping);
    }

    #[test]
    fn parse_command_response() {
        let frame: AgentFrame = serde_json::from_value(
            json!({"type": "command_response", "command_id": "c-1", "success": true}),
        )
        .unwrap();
        assert_eq!(
            frame,
            AgentFrame::CommandResponse { command_id: Some("c-1".into()) }
        );
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(serde_json::from_value::<AgentFrame>(json!({"type": "reboot"})).is_err());
        assert!(serde_json::from_value::<AgentFrame>(json!({"type": "register"})).is_err());
    }

    #[test]
    fn command_frame_shape() {
        let cmd = NewCommand::new(CommandType::TunnelFetch, "a-1")
            .with_sub_resource("tab-3")
            .with_payload(json!({"url": "https://example.com"}))
            .into_command(CommandStatus::Pending);
        let value = serde_json::to_value(GatewayFrame::command(&cmd)).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["command_id"], cmd.id.as_str());
        assert_eq!(value["command_type"], "tunnel-fetch");
        assert_eq!(value["target_sub_resource"], "tab-3");
        assert_eq!(value["payload"]["url"], "https://example.com");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn pong_frame_shape() {
        let value = serde_json::to_value(GatewayFrame::pong()).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value["timestamp"].is_string());
    }
}
