//! Durable session history: turns, patches, events, budget counters.
//!
//! SQLite-backed. The store owns the durability of Turn/Patch/Event
//! records; the live in-memory session is owned by the applier. Undo
//! bookkeeping lives here: a patch is "consumed" (marked undone) the
//! moment its revert batch is applied, so it can never be undone twice.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use riff_protocol::{ApplyStatus, BudgetStatus, Command, Event, EventLevel, RevertBatch,
    ValidationReport};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    status TEXT NOT NULL,
    active_song_path TEXT,
    troubleshoot_used INTEGER NOT NULL DEFAULT 0,
    troubleshoot_limit INTEGER NOT NULL DEFAULT 3
);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    intent TEXT NOT NULL,
    model TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS patches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    turn_id INTEGER NOT NULL,
    commands_json TEXT NOT NULL,
    effective_json TEXT NOT NULL,
    notes_json TEXT NOT NULL,
    emitted_json TEXT NOT NULL,
    validation_json TEXT NOT NULL,
    apply_status TEXT NOT NULL,
    revert_json TEXT NOT NULL,
    revert_reason TEXT,
    undone INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(turn_id) REFERENCES turns(id)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    ts TEXT NOT NULL,
    source TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
";

/// A persisted patch, as much of it as undo and re-apply need.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub id: i64,
    pub turn_id: i64,
    pub effective_commands: Vec<serde_json::Value>,
    pub apply_status: ApplyStatus,
    pub revert: RevertBatch,
    pub undone: bool,
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a store at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Fully in-memory store; history lives only as long as the process.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    pub fn ensure_session(&self, session_id: &str, troubleshoot_limit: u32) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions(id, status, troubleshoot_limit)
                 VALUES (?1, 'ready', ?2)
                 ON CONFLICT(id) DO UPDATE SET updated_at = CURRENT_TIMESTAMP",
                params![session_id, troubleshoot_limit],
            )?;
            Ok(())
        })
    }

    pub fn update_session_song(&self, session_id: &str, song_path: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET active_song_path = ?1, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?2",
                params![song_path, session_id],
            )?;
            Ok(())
        })
    }

    pub fn create_turn(
        &self,
        session_id: &str,
        prompt: &str,
        intent: &str,
        model: &str,
        latency_ms: u64,
    ) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO turns(session_id, prompt, intent, model, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, prompt, intent, model, latency_ms as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_patch(
        &self,
        turn_id: i64,
        commands: &[serde_json::Value],
        effective_commands: &[serde_json::Value],
        notes: &[String],
        emitted: &[String],
        validation: &ValidationReport,
        apply_status: ApplyStatus,
        revert: &RevertBatch,
    ) -> StoreResult<i64> {
        let (revert_json, revert_reason) = match revert {
            RevertBatch::Commands { commands } => (serde_json::to_string(commands)?, None),
            RevertBatch::Unavailable { reason } => ("[]".to_string(), Some(reason.clone())),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO patches(turn_id, commands_json, effective_json, notes_json,
                                     emitted_json, validation_json, apply_status,
                                     revert_json, revert_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    turn_id,
                    serde_json::to_string(commands)?,
                    serde_json::to_string(effective_commands)?,
                    serde_json::to_string(notes)?,
                    serde_json::to_string(emitted)?,
                    serde_json::to_string(validation)?,
                    apply_status_str(apply_status),
                    revert_json,
                    revert_reason,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_patch(&self, patch_id: i64) -> StoreResult<Option<PatchRecord>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, turn_id, effective_json, apply_status, revert_json,
                            revert_reason, undone
                     FROM patches WHERE id = ?1",
                    params![patch_id],
                    row_to_patch,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Most recent applied patch whose revert batch is non-empty and has
    /// not already been consumed by an undo.
    pub fn last_reversible_patch(&self, session_id: &str) -> StoreResult<Option<PatchRecord>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT p.id, p.turn_id, p.effective_json, p.apply_status,
                            p.revert_json, p.revert_reason, p.undone
                     FROM patches p
                     JOIN turns t ON t.id = p.turn_id
                     WHERE t.session_id = ?1
                       AND p.apply_status = 'applied'
                       AND p.undone = 0
                       AND p.revert_reason IS NULL
                       AND p.revert_json != '[]'
                     ORDER BY p.id DESC
                     LIMIT 1",
                    params![session_id],
                    row_to_patch,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Consume a patch so it cannot be undone twice.
    pub fn mark_undone(&self, patch_id: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE patches SET undone = 1 WHERE id = ?1",
                params![patch_id],
            )?;
            Ok(())
        })
    }

    pub fn budget(&self, session_id: &str) -> StoreResult<BudgetStatus> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT troubleshoot_used, troubleshoot_limit FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(BudgetStatus {
                        used: row.get(0)?,
                        limit: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
        })
    }

    /// Atomically spend one unit of the troubleshoot budget. Returns the
    /// post-spend status, or `None` when the budget is already exhausted.
    /// The counter is monotonic: nothing ever decrements or resets it
    /// within a session lifetime.
    pub fn spend_budget(&self, session_id: &str) -> StoreResult<Option<BudgetStatus>> {
        self.with_conn(|conn| {
            // Check-and-spend is one statement so concurrent spenders at
            // the last unit cannot both pass.
            let changed = conn.execute(
                "UPDATE sessions
                 SET troubleshoot_used = troubleshoot_used + 1,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND troubleshoot_used < troubleshoot_limit",
                params![session_id],
            )?;
            let budget = conn
                .query_row(
                    "SELECT troubleshoot_used, troubleshoot_limit FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| {
                        Ok(BudgetStatus {
                            used: row.get(0)?,
                            limit: row.get(1)?,
                        })
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            Ok((changed > 0).then_some(budget))
        })
    }

    pub fn log_event(&self, session_id: &str, event: &Event) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events(session_id, seq, ts, source, level, message, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session_id,
                    event.seq as i64,
                    event.ts.to_rfc3339(),
                    event.source,
                    level_str(event.level),
                    event.message,
                    serde_json::to_string(&event.payload)?,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent events for a session, newest first.
    pub fn recent_events(&self, session_id: &str, limit: u32) -> StoreResult<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, ts, source, level, message, payload_json
                 FROM events WHERE session_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit], |row| {
                let ts: String = row.get(1)?;
                let level: String = row.get(3)?;
                let payload: String = row.get(5)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    ts: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    source: row.get(2)?,
                    level: parse_level(&level),
                    message: row.get(4)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?;
            let mut events = Vec::new();
            for event in rows {
                events.push(event?);
            }
            Ok(events)
        })
    }
}

fn row_to_patch(row: &rusqlite::Row<'_>) -> rusqlite::Result<PatchRecord> {
    let effective: String = row.get(2)?;
    let status: String = row.get(3)?;
    let revert_json: String = row.get(4)?;
    let revert_reason: Option<String> = row.get(5)?;
    let undone: i64 = row.get(6)?;

    let revert = match revert_reason {
        Some(reason) => RevertBatch::Unavailable { reason },
        None => RevertBatch::Commands {
            commands: serde_json::from_str::<Vec<Command>>(&revert_json).unwrap_or_default(),
        },
    };

    Ok(PatchRecord {
        id: row.get(0)?,
        turn_id: row.get(1)?,
        effective_commands: serde_json::from_str(&effective).unwrap_or_default(),
        apply_status: parse_apply_status(&status),
        revert,
        undone: undone != 0,
    })
}

fn apply_status_str(status: ApplyStatus) -> &'static str {
    match status {
        ApplyStatus::Applied => "applied",
        ApplyStatus::Skipped => "skipped",
        ApplyStatus::Failed => "failed",
    }
}

fn parse_apply_status(status: &str) -> ApplyStatus {
    match status {
        "applied" => ApplyStatus::Applied,
        "failed" => ApplyStatus::Failed,
        _ => ApplyStatus::Skipped,
    }
}

fn level_str(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Debug => "debug",
        EventLevel::Info => "info",
        EventLevel::Warning => "warning",
        EventLevel::Error => "error",
    }
}

fn parse_level(level: &str) -> EventLevel {
    match level {
        "debug" => EventLevel::Debug,
        "warning" => EventLevel::Warning,
        "error" => EventLevel::Error,
        _ => EventLevel::Info,
    }
}
