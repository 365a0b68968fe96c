//! Result ingestion.
//!
//! Every category shares one contract: `command_id` and `agent_id` are
//! required, the result row is written first, then the command is moved to
//! `completed` or `failed` with a bounded summary as its response. Status
//! updates and incident cascades after the result row is written are
//! best-effort and only logged on failure.

mod capture;
mod fetch;
mod session;

pub use capture::{PopupResult, ScreenshotResult, SnapshotResult};
pub use fetch::{FetchResult, TunnelFetchResult};
pub use session::{CookieSync, CookieSyncReport};

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::command::{Command, CommandStatus, CommandType};
use crate::incident::{normalize_cookies, SessionRefresh};
use crate::store::{CommandStore, IncidentStore, OutcomeUpdate, ResultRecord, StoreError};

const MIB: usize = 1024 * 1024;

/// Per-category size caps, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestLimits {
    pub fetch_body: usize,
    pub tunnel_body: usize,
    pub snapshot_html: usize,
    pub screenshot_image: usize,
    pub popup_field: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            fetch_body: 10 * MIB,
            tunnel_body: 10 * MIB,
            snapshot_html: 5 * MIB,
            screenshot_image: 10 * MIB,
            popup_field: 64 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error("incident not found: {0}")]
    IncidentNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Returned to the agent once its result is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub success: bool,
    pub result_id: String,
    pub command_id: String,
    pub truncated: bool,
}

/// Truncate `s` in place to at most `cap` bytes without splitting a UTF-8
/// sequence. Returns true if anything was cut.
pub fn truncate_utf8(s: &mut String, cap: usize) -> bool {
    if s.len() <= cap {
        return false;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

/// Truncate every string inside `value` to `cap` bytes.
fn truncate_strings(value: &mut serde_json::Value, cap: usize) -> bool {
    match value {
        serde_json::Value::String(s) => truncate_utf8(s, cap),
        serde_json::Value::Array(items) => items
            .iter_mut()
            .fold(false, |cut, item| truncate_strings(item, cap) | cut),
        serde_json::Value::Object(map) => map
            .values_mut()
            .fold(false, |cut, item| truncate_strings(item, cap) | cut),
        _ => false,
    }
}

/// A present, non-empty string field.
fn required(value: Option<String>, field: &'static str) -> Result<String, IngestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(IngestError::MissingField(field)),
    }
}

/// Agent timestamps arrive as RFC 3339 strings or epoch milliseconds.
fn parse_reported_at(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok(),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn host_of(url: Option<&str>) -> Option<String> {
    reqwest::Url::parse(url?)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Everything needed to write one result row and its command update.
struct Draft {
    result_id: String,
    command_id: String,
    agent_id: String,
    category: CommandType,
    success: bool,
    payload: serde_json::Value,
    truncated: bool,
    error: Option<String>,
    error_type: Option<String>,
    elapsed_ms: Option<u64>,
    reported_at: Option<DateTime<Utc>>,
    /// Bounded summary stored as the command's response.
    summary: serde_json::Value,
}

impl Draft {
    fn new(category: CommandType, command_id: String, agent_id: String) -> Self {
        Self {
            result_id: uuid::Uuid::new_v4().to_string(),
            command_id,
            agent_id,
            category,
            success: true,
            payload: serde_json::Value::Null,
            truncated: false,
            error: None,
            error_type: None,
            elapsed_ms: None,
            reported_at: None,
            summary: serde_json::Value::Null,
        }
    }

    fn record(&self) -> ResultRecord {
        ResultRecord {
            id: self.result_id.clone(),
            command_id: self.command_id.clone(),
            agent_id: self.agent_id.clone(),
            category: self.category,
            success: self.success,
            payload: self.payload.clone(),
            truncated: self.truncated,
            error: self.error.clone(),
            error_type: self.error_type.clone(),
            elapsed_ms: self.elapsed_ms,
            reported_at: self.reported_at,
            received_at: Utc::now(),
        }
    }

    fn receipt(&self) -> Receipt {
        Receipt {
            success: true,
            result_id: self.result_id.clone(),
            command_id: self.command_id.clone(),
            truncated: self.truncated,
        }
    }
}

#[derive(Clone)]
pub struct ResultIngestor {
    commands: Arc<dyn CommandStore>,
    incidents: Arc<dyn IncidentStore>,
    limits: IngestLimits,
}

impl ResultIngestor {
    pub fn new(
        commands: Arc<dyn CommandStore>,
        incidents: Arc<dyn IncidentStore>,
        limits: IngestLimits,
    ) -> Self {
        Self {
            commands,
            incidents,
            limits,
        }
    }

    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// Write the result row, then apply the outcome to its command.
    ///
    /// Returns the receipt and, when the command is known, its current row
    /// (used for cascades). Only a failed result write is an error.
    fn persist(&self, draft: Draft) -> Result<(Receipt, Option<Command>), IngestError> {
        self.commands.insert_result(&draft.record())?;

        let status = if draft.success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };

        let command = match self
            .commands
            .record_outcome(&draft.command_id, status, draft.summary.clone())
        {
            Ok(OutcomeUpdate::Applied(command)) => {
                tracing::info!(
                    command_id = %draft.command_id,
                    agent_id = %draft.agent_id,
                    category = %draft.category,
                    status = %status,
                    truncated = draft.truncated,
                    "result ingested"
                );
                Some(command)
            }
            Ok(OutcomeUpdate::Rejected(current)) => {
                tracing::debug!(command_id = %draft.command_id, current = %current, "command status left unchanged");
                self.commands.get_command(&draft.command_id).ok().flatten()
            }
            Ok(OutcomeUpdate::Missing) => {
                tracing::warn!(command_id = %draft.command_id, category = %draft.category, "result for unknown command stored as orphan");
                None
            }
            Err(e) => {
                tracing::warn!(command_id = %draft.command_id, error = %e, "result stored but command status update failed");
                None
            }
        };

        Ok((draft.receipt(), command))
    }

    /// Replace the linked incident's cookies with ones a result carried.
    fn cascade_cookies(&self, command: Option<&Command>, raw: &[serde_json::Value], host: Option<&str>) {
        let Some(incident_id) = command.and_then(|c| c.incident_id.as_deref()) else {
            return;
        };
        let (cookies, skipped) = normalize_cookies(raw, host);
        if cookies.is_empty() {
            tracing::debug!(incident_id = %incident_id, skipped, "result carried no usable cookies");
            return;
        }
        let count = cookies.len();
        match self
            .incidents
            .refresh_session(incident_id, SessionRefresh::cookies_only(cookies))
        {
            Ok(true) => {
                tracing::info!(incident_id = %incident_id, cookies = count, "incident session refreshed from result");
            }
            Ok(false) => {
                tracing::warn!(incident_id = %incident_id, "cookie cascade skipped, incident missing");
            }
            Err(e) => {
                tracing::warn!(incident_id = %incident_id, error = %e, "cookie cascade failed");
            }
        }
    }
}
