//! Storage contracts for commands, results and incidents.
//!
//! The durable store is an external collaborator; the gateway only needs the
//! narrow operations below. [`MemoryStore`] keeps everything in process and
//! [`SqliteStore`] persists to a SQLite file.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStatus, CommandType, NewCommand};
use crate::incident::{Incident, SessionRefresh};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// A persisted result, correlated to its command by `command_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub command_id: String,
    pub agent_id: String,
    pub category: CommandType,
    pub success: bool,
    /// Category-specific data, already size-bounded.
    pub payload: serde_json::Value,
    pub truncated: bool,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub elapsed_ms: Option<u64>,
    /// Timestamp reported by the agent, if any.
    pub reported_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Outcome of applying a terminal status to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeUpdate {
    /// The command now carries the new status and response.
    Applied(Command),
    /// The command exists but its current status forbids the change.
    Rejected(CommandStatus),
    /// No command with that id.
    Missing,
}

pub trait CommandStore: Send + Sync {
    /// Insert a new command row in the given initial status.
    fn insert_command(&self, new: NewCommand, status: CommandStatus) -> Result<Command, StoreError>;

    fn get_command(&self, id: &str) -> Result<Option<Command>, StoreError>;

    /// Move a command from `pending` to `sent`. Returns false if it was not
    /// pending (already claimed, completed, or unknown).
    fn mark_sent(&self, id: &str) -> Result<bool, StoreError>;

    /// Atomically claim up to `limit` of the agent's oldest pending commands,
    /// flipping each to `sent`. Returned in creation order.
    fn claim_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<Command>, StoreError>;

    /// Apply a terminal status and response summary. Last write wins between
    /// `completed` and `failed`; nothing moves backward.
    fn record_outcome(
        &self,
        id: &str,
        status: CommandStatus,
        response: serde_json::Value,
    ) -> Result<OutcomeUpdate, StoreError>;

    fn insert_result(&self, result: &ResultRecord) -> Result<(), StoreError>;

    /// Record a command that already ran, together with its result. Both rows
    /// are written or neither is; the result's `command_id` is set to the new
    /// command's id.
    fn insert_executed(&self, new: NewCommand, result: ResultRecord) -> Result<Command, StoreError>;

    /// Results for a command, oldest first.
    fn results_for(&self, command_id: &str) -> Result<Vec<ResultRecord>, StoreError>;
}

pub trait IncidentStore: Send + Sync {
    /// Create an empty incident, or return the existing one.
    fn ensure_incident(&self, id: &str) -> Result<Incident, StoreError>;

    fn get_incident(&self, id: &str) -> Result<Option<Incident>, StoreError>;

    /// Replace the incident's session fields. Returns false if the incident
    /// does not exist.
    fn refresh_session(&self, id: &str, refresh: SessionRefresh) -> Result<bool, StoreError>;
}

/// Open the store the server runs with: SQLite when a path is given,
/// otherwise in-memory.
pub fn open(
    db: Option<&std::path::Path>,
) -> Result<(std::sync::Arc<dyn CommandStore>, std::sync::Arc<dyn IncidentStore>), StoreError> {
    match db {
        Some(path) => {
            let store = std::sync::Arc::new(SqliteStore::open(path)?);
            Ok((store.clone(), store))
        }
        None => {
            let store = std::sync::Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}
