// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, ToSql};
use tracing::{debug, info};

use quill_config::ChatMode;
use quill_model::{join_text_parts, Message, Part, Role};

use crate::db;
use crate::error::{is_busy, is_constraint, Result, StoreError};
use crate::types::{
    ListOptions, MetricsDelta, SearchHit, Session, SessionMetrics, SessionStatus, SessionSummary,
};
use crate::SessionStore;

/// Maximum application-level retries on a busy database, with exponential
/// backoff starting at [`RETRY_BASE`].
const MAX_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(10);

const SESSION_COLS: &str = "id, number, name, summary, provider_label, provider_key, model, \
     mode, agent, cwd, created_at, updated_at, archived, parent_id, search_flag, \
     tools_csv, mcp_csv, user_turns, llm_turns, tool_calls, input_tokens, \
     cached_input_tokens, output_tokens, status, tags_csv";

/// Options for opening the store.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Open without write access; schema init and cleanup are skipped.
    pub read_only: bool,
    /// Delete non-archived sessions older than this many days (0 = off).
    pub max_age_days: u32,
    /// Keep at most this many non-archived sessions (0 = off).
    pub max_count: u32,
}

/// Default database location: `$XDG_DATA_HOME/quill/sessions.db`, falling
/// back to `~/.local/share/quill/sessions.db`.
pub fn default_db_path() -> PathBuf {
    let root = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    root.join("quill").join("sessions.db")
}

/// SQLite-backed [`SessionStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and in read-write mode, initialise and clean up) the database
    /// at `path`.
    pub fn open(path: &Path, opts: &StoreOptions) -> Result<Self> {
        if !opts.read_only {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = if opts.read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            Connection::open(path)
        }
        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;

        db::apply_pragmas(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        if !opts.read_only {
            store.locked(|conn| db::init_schema(conn))?;
            store.cleanup(opts)?;
        }
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        db::apply_pragmas(&conn)?;
        db::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn locked<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        f(&mut conn)
    }

    /// Run `f` with up to [`MAX_RETRIES`] retries on busy/locked errors,
    /// sleeping 10/20/40/80/160 ms between attempts. Constraint violations
    /// are reclassified as [`StoreError::Conflict`] and not retried — a
    /// duplicate key will not resolve by waiting.
    fn with_retry<T>(&self, mut f: impl FnMut(&mut Connection) -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let result = self.locked(&mut f);
            match result {
                Err(StoreError::Database(ref e)) if is_constraint(e) => {
                    return Err(StoreError::Conflict(e.to_string()));
                }
                Err(StoreError::Database(ref e)) if is_busy(e) && attempt < MAX_RETRIES => {
                    let wait = RETRY_BASE * 2u32.pow(attempt);
                    debug!(attempt, wait_ms = wait.as_millis() as u64, "store busy; retrying");
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(StoreError::Database(e)) if is_busy(&e) => {
                    return Err(StoreError::Busy(e.to_string()));
                }
                other => return other,
            }
        }
    }

    /// Startup cleanup (read-write mode only): age-based deletion, then a
    /// trim to the most recent `max_count` non-archived sessions.
    fn cleanup(&self, opts: &StoreOptions) -> Result<()> {
        if opts.max_age_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(opts.max_age_days as i64);
            let removed = self.with_retry(|conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE archived = 0 AND updated_at < ?1",
                    [ts(&cutoff)],
                )?)
            })?;
            if removed > 0 {
                info!(removed, max_age_days = opts.max_age_days, "expired old sessions");
            }
        }
        if opts.max_count > 0 {
            let removed = self.with_retry(|conn| {
                Ok(conn.execute(
                    "DELETE FROM sessions WHERE archived = 0 AND id NOT IN (
                        SELECT id FROM sessions WHERE archived = 0
                        ORDER BY updated_at DESC LIMIT ?1
                    )",
                    [opts.max_count as i64],
                )?)
            })?;
            if removed > 0 {
                info!(removed, max_count = opts.max_count, "trimmed session backlog");
            }
        }
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn create(&self, session: &mut Session) -> Result<()> {
        if session.id.is_empty() {
            session.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        session.created_at = now;
        session.updated_at = now;
        session.status = SessionStatus::Active;

        // `MAX(number) + 1` inside the INSERT keeps number assignment atomic
        // with the row creation (no read-then-write window).
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO sessions (
                    id, number, name, summary, provider_label, provider_key, model,
                    mode, agent, cwd, created_at, updated_at, archived, parent_id,
                    search_flag, tools_csv, mcp_csv, status, tags_csv
                ) VALUES (
                    ?1, (SELECT COALESCE(MAX(number), 0) + 1 FROM sessions),
                    ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
                )",
                rusqlite::params![
                    session.id,
                    session.name,
                    session.summary,
                    session.provider_label,
                    session.provider_key,
                    session.model,
                    session.mode.as_str(),
                    session.agent,
                    session.cwd,
                    ts(&now),
                    session.archived,
                    session.parent_id,
                    session.search_flag,
                    session.tools_csv,
                    session.mcp_csv,
                    session.status.as_str(),
                    session.tags_csv,
                ],
            )?;
            Ok(())
        })?;

        session.number = self.with_retry(|conn| {
            Ok(conn.query_row(
                "SELECT number FROM sessions WHERE id = ?1",
                [&session.id],
                |row| row.get(0),
            )?)
        })?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        self.locked(|conn| {
            match conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                [id],
                row_to_session,
            ) {
                Ok(s) => Ok(Some(s)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_by_number(&self, number: i64) -> Result<Option<Session>> {
        self.locked(|conn| {
            match conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE number = ?1"),
                [number],
                row_to_session,
            ) {
                Ok(s) => Ok(Some(s)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_by_prefix(&self, prefix: &str) -> Result<Option<Session>> {
        let trimmed = prefix.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if let Some(rest) = trimmed.strip_prefix('#') {
            if let Ok(n) = rest.parse::<i64>() {
                return self.get_by_number(n);
            }
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            if let Some(s) = self.get_by_number(n)? {
                return Ok(Some(s));
            }
        }
        if let Some(s) = self.get(trimmed)? {
            return Ok(Some(s));
        }
        // Short-id prefix; ambiguity resolves to the most recently updated.
        self.locked(|conn| {
            match conn.query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM sessions
                     WHERE id LIKE ?1 || '%' ORDER BY updated_at DESC LIMIT 1"
                ),
                [trimmed],
                row_to_session,
            ) {
                Ok(s) => Ok(Some(s)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn update(&self, session: &Session) -> Result<()> {
        let now = Utc::now();
        let changed = self.with_retry(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET
                    name = ?2, summary = ?3, provider_label = ?4, provider_key = ?5,
                    model = ?6, mode = ?7, agent = ?8, cwd = ?9, archived = ?10,
                    parent_id = ?11, search_flag = ?12, tools_csv = ?13, mcp_csv = ?14,
                    status = ?15, tags_csv = ?16, updated_at = ?17
                 WHERE id = ?1",
                rusqlite::params![
                    session.id,
                    session.name,
                    session.summary,
                    session.provider_label,
                    session.provider_key,
                    session.model,
                    session.mode.as_str(),
                    session.agent,
                    session.cwd,
                    session.archived,
                    session.parent_id,
                    session.search_flag,
                    session.tools_csv,
                    session.mcp_csv,
                    session.status.as_str(),
                    session.tags_csv,
                    ts(&now),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn update_metrics(&self, id: &str, delta: &MetricsDelta) -> Result<()> {
        let changed = self.with_retry(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET
                    llm_turns = llm_turns + ?2,
                    tool_calls = tool_calls + ?3,
                    input_tokens = input_tokens + ?4,
                    output_tokens = output_tokens + ?5,
                    cached_input_tokens = cached_input_tokens + ?6,
                    updated_at = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    delta.llm_turns as i64,
                    delta.tool_calls as i64,
                    delta.input_tokens as i64,
                    delta.output_tokens as i64,
                    delta.cached_input_tokens as i64,
                    ts(&Utc::now()),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let changed = self.with_retry(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, status.as_str(), ts(&Utc::now())],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn increment_user_turns(&self, id: &str) -> Result<()> {
        let changed = self.with_retry(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET user_turns = user_turns + 1, updated_at = ?2 WHERE id = ?1",
                rusqlite::params![id, ts(&Utc::now())],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let changed = self
            .with_retry(|conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn list(&self, opts: &ListOptions) -> Result<Vec<SessionSummary>> {
        let mut sql = format!(
            "SELECT {SESSION_COLS},
                (SELECT COUNT(*) FROM messages m WHERE m.session_id = sessions.id)
             FROM sessions WHERE 1 = 1"
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if !opts.include_archived {
            sql.push_str(" AND archived = 0");
        }
        if let Some(ref name) = opts.name {
            sql.push_str(" AND name LIKE '%' || ? || '%'");
            params.push(Box::new(name.clone()));
        }
        if let Some(ref provider) = opts.provider {
            sql.push_str(" AND provider_key = ?");
            params.push(Box::new(provider.clone()));
        }
        if let Some(ref model) = opts.model {
            sql.push_str(" AND model = ?");
            params.push(Box::new(model.clone()));
        }
        if let Some(mode) = opts.mode {
            sql.push_str(" AND mode = ?");
            params.push(Box::new(mode.as_str()));
        }
        if let Some(status) = opts.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }
        if let Some(ref tag) = opts.tag {
            // Comma-wrap both sides so `rust` does not match `rustls`.
            sql.push_str(" AND instr(',' || tags_csv || ',', ',' || ? || ',') > 0");
            params.push(Box::new(tag.clone()));
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");
        let limit = if opts.limit == 0 { 50 } else { opts.limit };
        params.push(Box::new(limit as i64));
        params.push(Box::new(opts.offset as i64));

        self.locked(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    let session = row_to_session(row)?;
                    let message_count: i64 = row.get(25)?;
                    Ok(SessionSummary {
                        session,
                        message_count: message_count.max(0) as u64,
                    })
                },
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let limit = if limit == 0 { 20 } else { limit };
        self.locked(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.session_id, m.id,
                        snippet(messages_fts, 0, '**', '**', '…', 12)
                 FROM messages_fts
                 JOIN messages m ON m.id = messages_fts.rowid
                 WHERE messages_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![query, limit as i64], |row| {
                Ok(SearchHit {
                    session_id: row.get(0)?,
                    message_id: row.get(1)?,
                    snippet: row.get(2)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn add_message(&self, session_id: &str, msg: &mut Message) -> Result<()> {
        // Derived field is authoritative at the storage boundary.
        msg.extracted_text = join_text_parts(&msg.parts);
        let parts_json = serde_json::to_string(&msg.parts)?;
        let created = ts(&msg.created_at);
        let requested_seq = msg.sequence;

        let (id, seq) = self.with_retry(|conn| {
            let tx = conn.transaction()?;
            let seq: i64 = if requested_seq < 0 {
                tx.query_row(
                    "SELECT COALESCE(MAX(sequence) + 1, 0) FROM messages WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )?
            } else {
                requested_seq
            };
            tx.execute(
                "INSERT INTO messages
                    (session_id, role, parts, extracted_text, duration_ms, created_at, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session_id,
                    msg.role.as_str(),
                    parts_json,
                    msg.extracted_text,
                    msg.duration_ms,
                    created,
                    seq,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![session_id, ts(&Utc::now())],
            )?;
            tx.commit()?;
            Ok((id, seq))
        })?;

        msg.id = id;
        msg.sequence = seq;
        msg.session_id = session_id.to_string();
        Ok(())
    }

    fn replace_messages(&self, session_id: &str, msgs: &mut [Message]) -> Result<()> {
        for msg in msgs.iter_mut() {
            msg.extracted_text = join_text_parts(&msg.parts);
        }
        let encoded: Vec<(String, String, String, Option<i64>, String)> = msgs
            .iter()
            .map(|m| {
                serde_json::to_string(&m.parts).map(|parts| {
                    (
                        m.role.as_str().to_string(),
                        parts,
                        m.extracted_text.clone(),
                        m.duration_ms,
                        ts(&m.created_at),
                    )
                })
            })
            .collect::<std::result::Result<_, _>>()?;

        let ids = self.with_retry(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
            let mut ids = Vec::with_capacity(encoded.len());
            for (seq, (role, parts, extracted, duration, created)) in encoded.iter().enumerate() {
                tx.execute(
                    "INSERT INTO messages
                        (session_id, role, parts, extracted_text, duration_ms, created_at, sequence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        session_id,
                        role,
                        parts,
                        extracted,
                        duration,
                        created,
                        seq as i64,
                    ],
                )?;
                ids.push(tx.last_insert_rowid());
            }
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![session_id, ts(&Utc::now())],
            )?;
            tx.commit()?;
            Ok(ids)
        })?;

        for (i, msg) in msgs.iter_mut().enumerate() {
            msg.id = ids[i];
            msg.sequence = i as i64;
            msg.session_id = session_id.to_string();
        }
        Ok(())
    }

    fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.locked(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, parts, extracted_text, duration_ms,
                        created_at, sequence
                 FROM messages WHERE session_id = ?1
                 ORDER BY sequence ASC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![session_id, limit, offset as i64],
                row_to_message,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn set_current(&self, id: &str) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO current_session (id, session_id) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET session_id = excluded.session_id",
                [id],
            )?;
            Ok(())
        })
    }

    fn get_current(&self) -> Result<Option<String>> {
        self.locked(|conn| {
            match conn.query_row(
                "SELECT session_id FROM current_session WHERE id = 1",
                [],
                |row| row.get(0),
            ) {
                Ok(id) => Ok(Some(id)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn clear_current(&self) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute("DELETE FROM current_session WHERE id = 1", [])?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        // The connection is dropped with the store; flush the WAL so a
        // read-only open sees everything without replaying the log.
        self.locked(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .ok();
            Ok(())
        })
    }
}

/// RFC 3339 with fixed microsecond width so lexicographic string order
/// matches chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let mode_str: String = row.get(7)?;
    let status_str: String = row.get(23)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(Session {
        id: row.get(0)?,
        number: row.get(1)?,
        name: row.get(2)?,
        summary: row.get(3)?,
        provider_label: row.get(4)?,
        provider_key: row.get(5)?,
        model: row.get(6)?,
        mode: ChatMode::parse(&mode_str).unwrap_or(ChatMode::Chat),
        agent: row.get(8)?,
        cwd: row.get(9)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
        archived: row.get(12)?,
        parent_id: row.get(13)?,
        search_flag: row.get(14)?,
        tools_csv: row.get(15)?,
        mcp_csv: row.get(16)?,
        metrics: SessionMetrics {
            user_turns: row.get::<_, i64>(17)?.max(0) as u64,
            llm_turns: row.get::<_, i64>(18)?.max(0) as u64,
            tool_calls: row.get::<_, i64>(19)?.max(0) as u64,
            input_tokens: row.get::<_, i64>(20)?.max(0) as u64,
            cached_input_tokens: row.get::<_, i64>(21)?.max(0) as u64,
            output_tokens: row.get::<_, i64>(22)?.max(0) as u64,
        },
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Active),
        tags_csv: row.get(24)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let parts_json: String = row.get(3)?;
    let created: String = row.get(6)?;
    let parts: Vec<Part> = serde_json::from_str(&parts_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::User),
        parts,
        extracted_text: row.get(4)?,
        duration_ms: row.get(5)?,
        created_at: parse_ts(&created)?,
        sequence: row.get(7)?,
    })
}
