use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{CommandStore, IncidentStore, OutcomeUpdate, ResultRecord, StoreError};
use crate::command::{Command, CommandStatus, NewCommand};
use crate::incident::{cookie_excerpt, Incident, SessionRefresh};

const COMMAND_COLUMNS: &str = "id, command_type, target_agent_id, target_sub_resource, incident_id, \
     payload, status, created_at, sent_at, completed_at, response";

const RESULT_COLUMNS: &str = "id, command_id, agent_id, category, success, payload, truncated, \
     error, error_type, elapsed_ms, reported_at, received_at";

/// SQLite-backed store.
///
/// A single connection behind a mutex; every multi-statement operation runs
/// in an immediate transaction so claims are atomic across processes sharing
/// the file as well.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS commands (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                command_type TEXT NOT NULL,
                target_agent_id TEXT NOT NULL,
                target_sub_resource TEXT,
                incident_id TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                completed_at TEXT,
                response TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_commands_agent_status
                ON commands(target_agent_id, status, seq);

            CREATE TABLE IF NOT EXISTS results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                command_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                category TEXT NOT NULL,
                success INTEGER NOT NULL,
                payload TEXT NOT NULL,
                truncated INTEGER NOT NULL,
                error TEXT,
                error_type TEXT,
                elapsed_ms INTEGER,
                reported_at TEXT,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_command ON results(command_id, seq);

            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                cookies TEXT NOT NULL,
                cookie_excerpt TEXT,
                local_storage TEXT,
                session_storage TEXT,
                updated_at TEXT NOT NULL
            );",
        )?;
        tracing::debug!("sqlite store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_opt_json(raw: Option<String>) -> Result<Option<serde_json::Value>, StoreError> {
    Ok(raw.as_deref().map(serde_json::from_str::<serde_json::Value>).transpose()?)
}

/// Column values of a `commands` row before conversion.
struct CommandRow {
    id: String,
    command_type: String,
    target_agent_id: String,
    target_sub_resource: Option<String>,
    incident_id: Option<String>,
    payload: String,
    status: String,
    created_at: String,
    sent_at: Option<String>,
    completed_at: Option<String>,
    response: Option<String>,
}

impl CommandRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command_type: row.get(1)?,
            target_agent_id: row.get(2)?,
            target_sub_resource: row.get(3)?,
            incident_id: row.get(4)?,
            payload: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            sent_at: row.get(8)?,
            completed_at: row.get(9)?,
            response: row.get(10)?,
        })
    }

    fn into_command(self) -> Result<Command, StoreError> {
        Ok(Command {
            command_type: self.command_type.parse().map_err(StoreError::Corrupt)?,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            id: self.id,
            target_agent_id: self.target_agent_id,
            target_sub_resource: self.target_sub_resource,
            incident_id: self.incident_id,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_ts(&self.created_at)?,
            sent_at: parse_opt_ts(self.sent_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            response: parse_opt_json(self.response)?,
        })
    }
}

struct ResultRow {
    id: String,
    command_id: String,
    agent_id: String,
    category: String,
    success: bool,
    payload: String,
    truncated: bool,
    error: Option<String>,
    error_type: Option<String>,
    elapsed_ms: Option<i64>,
    reported_at: Option<String>,
    received_at: String,
}

impl ResultRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command_id: row.get(1)?,
            agent_id: row.get(2)?,
            category: row.get(3)?,
            success: row.get(4)?,
            payload: row.get(5)?,
            truncated: row.get(6)?,
            error: row.get(7)?,
            error_type: row.get(8)?,
            elapsed_ms: row.get(9)?,
            reported_at: row.get(10)?,
            received_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<ResultRecord, StoreError> {
        Ok(ResultRecord {
            category: self.category.parse().map_err(StoreError::Corrupt)?,
            id: self.id,
            command_id: self.command_id,
            agent_id: self.agent_id,
            success: self.success,
            payload: serde_json::from_str(&self.payload)?,
            truncated: self.truncated,
            error: self.error,
            error_type: self.error_type,
            elapsed_ms: self.elapsed_ms.map(|ms| ms.max(0) as u64),
            reported_at: parse_opt_ts(self.reported_at)?,
            received_at: parse_ts(&self.received_at)?,
        })
    }
}

fn select_command(conn: &Connection, id: &str) -> Result<Option<Command>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM commands WHERE id = ?1", COMMAND_COLUMNS),
            params![id],
            CommandRow::read,
        )
        .optional()?;
    row.map(CommandRow::into_command).transpose()
}

fn select_incident(conn: &Connection, id: &str) -> Result<Option<Incident>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, cookies, cookie_excerpt, local_storage, session_storage, updated_at
             FROM incidents WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, cookies, cookie_excerpt, local_storage, session_storage, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(Incident {
        id,
        cookies: serde_json::from_str(&cookies)?,
        cookie_excerpt,
        local_storage: parse_opt_json(local_storage)?,
        session_storage: parse_opt_json(session_storage)?,
        updated_at: parse_ts(&updated_at)?,
    }))
}

fn opt_json(value: &Option<serde_json::Value>) -> Result<Option<String>, StoreError> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn insert_command_row(conn: &Connection, command: &Command) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO commands (id, command_type, target_agent_id, target_sub_resource,
            incident_id, payload, status, created_at, completed_at, response)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            command.id,
            command.command_type.as_str(),
            command.target_agent_id,
            command.target_sub_resource,
            command.incident_id,
            serde_json::to_string(&command.payload)?,
            command.status.as_str(),
            ts(command.created_at),
            command.completed_at.map(ts),
            command.response.as_ref().map(serde_json::to_string).transpose()?,
        ],
    )?;
    Ok(())
}

fn insert_result_row(conn: &Connection, result: &ResultRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            RESULT_COLUMNS
        ),
        params![
            result.id,
            result.command_id,
            result.agent_id,
            result.category.as_str(),
            result.success,
            serde_json::to_string(&result.payload)?,
            result.truncated,
            result.error,
            result.error_type,
            result.elapsed_ms.map(|ms| ms.min(i64::MAX as u64) as i64),
            result.reported_at.map(ts),
            ts(result.received_at),
        ],
    )?;
    Ok(())
}

impl CommandStore for SqliteStore {
    fn insert_command(&self, new: NewCommand, status: CommandStatus) -> Result<Command, StoreError> {
        let command = new.into_command(status);
        insert_command_row(&self.conn.lock(), &command)?;
        Ok(command)
    }

    fn get_command(&self, id: &str) -> Result<Option<Command>, StoreError> {
        select_command(&self.conn.lock(), id)
    }

    fn mark_sent(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE commands SET status = 'sent', sent_at = ?1 WHERE id = ?2 AND status = 'pending'",
            params![ts(Utc::now()), id],
        )?;
        Ok(changed == 1)
    }

    fn claim_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<Command>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM commands
                 WHERE target_agent_id = ?1 AND status = 'pending'
                 ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![agent_id, limit as i64], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>()?
        };

        let now = ts(Utc::now());
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = tx.execute(
                "UPDATE commands SET status = 'sent', sent_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )?;
            if changed == 1 {
                if let Some(command) = select_command(&tx, &id)? {
                    claimed.push(command);
                }
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    fn record_outcome(
        &self,
        id: &str,
        status: CommandStatus,
        response: serde_json::Value,
    ) -> Result<OutcomeUpdate, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = select_command(&tx, id)? else {
            return Ok(OutcomeUpdate::Missing);
        };
        if !current.status.can_transition_to(status) {
            return Ok(OutcomeUpdate::Rejected(current.status));
        }

        tx.execute(
            "UPDATE commands SET status = ?1, response = ?2, completed_at = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                serde_json::to_string(&response)?,
                ts(Utc::now()),
                id
            ],
        )?;
        let updated = select_command(&tx, id)?;
        tx.commit()?;

        Ok(match updated {
            Some(command) => OutcomeUpdate::Applied(command),
            None => OutcomeUpdate::Missing,
        })
    }

    fn insert_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        insert_result_row(&self.conn.lock(), result)
    }

    fn insert_executed(&self, new: NewCommand, mut result: ResultRecord) -> Result<Command, StoreError> {
        let command = new.into_command(CommandStatus::Executed);
        result.command_id = command.id.clone();

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_command_row(&tx, &command)?;
        insert_result_row(&tx, &result)?;
        tx.commit()?;
        Ok(command)
    }

    fn results_for(&self, command_id: &str) -> Result<Vec<ResultRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM results WHERE command_id = ?1 ORDER BY seq ASC",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![command_id], ResultRow::read)?;
        let records = rows
            .map(|row| row.map_err(StoreError::from).and_then(ResultRow::into_record))
            .collect::<Result<Vec<_>, _>>();
        records
    }
}

impl IncidentStore for SqliteStore {
    fn ensure_incident(&self, id: &str) -> Result<Incident, StoreError> {
        let conn = self.conn.lock();
        let fresh = Incident::new(id);
        conn.execute(
            "INSERT OR IGNORE INTO incidents (id, cookies, updated_at) VALUES (?1, '[]', ?2)",
            params![id, ts(fresh.updated_at)],
        )?;
        Ok(select_incident(&conn, id)?.unwrap_or(fresh))
    }

    fn get_incident(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        select_incident(&self.conn.lock(), id)
    }

    fn refresh_session(&self, id: &str, refresh: SessionRefresh) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let excerpt = cookie_excerpt(&refresh.cookies);
        let cookies = serde_json::to_string(&refresh.cookies)?;
        let now = ts(Utc::now());

        let changed = match refresh.storage {
            Some(storage) => conn.execute(
                "UPDATE incidents SET cookies = ?1, cookie_excerpt = ?2, local_storage = ?3,
                    session_storage = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    cookies,
                    excerpt,
                    opt_json(&storage.local_storage)?,
                    opt_json(&storage.session_storage)?,
                    now,
                    id
                ],
            )?,
            None => conn.execute(
                "UPDATE incidents SET cookies = ?1, cookie_excerpt = ?2, updated_at = ?3 WHERE id = ?4",
                params![cookies, excerpt, now, id],
            )?,
        };
        Ok(changed == 1)
    }
}
