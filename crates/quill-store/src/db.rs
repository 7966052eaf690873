// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Schema definition and forward-only migrations.
//!
//! The schema version lives in a single-row `schema_version` table. A fresh
//! database gets the latest schema directly and is stamped with
//! [`SCHEMA_VERSION`]; an existing database applies numbered migrations in
//! ascending order. Every migration is idempotent with respect to
//! already-applied columns and indexes, so a crash between a DDL statement
//! and the version bump is recovered on the next open.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 3;

/// Connection-level pragmas applied on every open.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA mmap_size = 134217728;
         PRAGMA cache_size = -64000;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn init_schema(conn: &Connection) -> Result<()> {
    let version = current_version(conn)?;
    if version == 0 {
        create_latest(conn)?;
        set_version(conn, SCHEMA_VERSION)?;
        return Ok(());
    }
    if version < 2 {
        info!(from = version, "applying store migration 2");
        migrate_v2(conn)?;
        set_version(conn, 2)?;
    }
    if version < 3 {
        info!(from = version.max(2), "applying store migration 3");
        migrate_v3(conn)?;
        set_version(conn, 3)?;
    }
    Ok(())
}

/// Current schema version; 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<i64> {
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !table_exists {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);
    Ok(version)
}

fn set_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );",
    )?;
    conn.execute(
        "INSERT INTO schema_version (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        [version],
    )?;
    Ok(())
}

/// Full schema as of the latest version, for fresh databases.
fn create_latest(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                  TEXT PRIMARY KEY,
            number              INTEGER NOT NULL UNIQUE,
            name                TEXT,
            summary             TEXT NOT NULL DEFAULT '',
            provider_label      TEXT NOT NULL DEFAULT '',
            provider_key        TEXT NOT NULL DEFAULT '',
            model               TEXT NOT NULL DEFAULT '',
            mode                TEXT NOT NULL DEFAULT 'chat',
            agent               TEXT,
            cwd                 TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            archived            INTEGER NOT NULL DEFAULT 0,
            parent_id           TEXT,
            search_flag         INTEGER NOT NULL DEFAULT 0,
            tools_csv           TEXT NOT NULL DEFAULT '',
            mcp_csv             TEXT NOT NULL DEFAULT '',
            user_turns          INTEGER NOT NULL DEFAULT 0,
            llm_turns           INTEGER NOT NULL DEFAULT 0,
            tool_calls          INTEGER NOT NULL DEFAULT 0,
            input_tokens        INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens       INTEGER NOT NULL DEFAULT 0,
            status              TEXT NOT NULL DEFAULT 'active',
            tags_csv            TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_updated
            ON sessions(updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role          TEXT NOT NULL,
            parts         TEXT NOT NULL,
            extracted_text TEXT NOT NULL DEFAULT '',
            duration_ms   INTEGER,
            created_at    TEXT NOT NULL,
            sequence      INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_session_seq
            ON messages(session_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id);

        CREATE TABLE IF NOT EXISTS current_session (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            session_id TEXT NOT NULL
        );",
    )?;
    create_fts(conn)?;
    Ok(())
}

/// v2: tag support and dense session numbering.
///
/// Early builds had no `number` column; assign numbers 1..N in `created_at`
/// order so existing sessions stay addressable as `#N`.
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "sessions", "tags_csv")? {
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN tags_csv TEXT NOT NULL DEFAULT ''")?;
    }
    if !column_exists(conn, "sessions", "number")? {
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN number INTEGER NOT NULL DEFAULT 0")?;
    }
    // Backfill: dense numbers in creation order for rows that have none.
    let needs_backfill: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE number <= 0",
        [],
        |row| row.get(0),
    )?;
    if needs_backfill > 0 {
        conn.execute_batch(
            "UPDATE sessions SET number = (
                SELECT COUNT(*) FROM sessions AS s2
                WHERE s2.created_at < sessions.created_at
                   OR (s2.created_at = sessions.created_at AND s2.id <= sessions.id)
            )",
        )?;
    }
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_number ON sessions(number)",
    )?;
    Ok(())
}

/// v3: full-text search over message text, kept in sync by triggers.
/// Rebuild indexes any rows inserted before the FTS table existed.
fn migrate_v3(conn: &Connection) -> Result<()> {
    create_fts(conn)?;
    conn.execute_batch(
        "INSERT INTO messages_fts(messages_fts) VALUES ('rebuild')",
    )?;
    Ok(())
}

fn create_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
            USING fts5(extracted_text, content='messages', content_rowid='id');

        CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, extracted_text)
            VALUES (new.id, new.extracted_text);
        END;
        CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, extracted_text)
            VALUES ('delete', old.id, old.extracted_text);
        END;
        CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, extracted_text)
            VALUES ('delete', old.id, old.extracted_text);
            INSERT INTO messages_fts(rowid, extracted_text)
            VALUES (new.id, new.extracted_text);
        END;",
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        conn
    }

    #[test]
    fn fresh_database_jumps_to_latest_version() {
        let conn = mem_conn();
        init_schema(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn init_schema_is_idempotent() {
        let conn = mem_conn();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn version_zero_before_init() {
        let conn = mem_conn();
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn migration_backfills_dense_session_numbers() {
        let conn = mem_conn();
        // Simulate a v1 database: sessions without number or tags_csv.
        conn.execute_batch(
            "CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                name TEXT, summary TEXT NOT NULL DEFAULT '',
                provider_label TEXT NOT NULL DEFAULT '',
                provider_key TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                mode TEXT NOT NULL DEFAULT 'chat',
                agent TEXT, cwd TEXT,
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                parent_id TEXT, search_flag INTEGER NOT NULL DEFAULT 0,
                tools_csv TEXT NOT NULL DEFAULT '', mcp_csv TEXT NOT NULL DEFAULT '',
                user_turns INTEGER NOT NULL DEFAULT 0, llm_turns INTEGER NOT NULL DEFAULT 0,
                tool_calls INTEGER NOT NULL DEFAULT 0, input_tokens INTEGER NOT NULL DEFAULT 0,
                cached_input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
            );
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL, parts TEXT NOT NULL,
                extracted_text TEXT NOT NULL DEFAULT '',
                duration_ms INTEGER, created_at TEXT NOT NULL,
                sequence INTEGER NOT NULL
            );
            CREATE TABLE current_session (
                id INTEGER PRIMARY KEY CHECK (id = 1), session_id TEXT NOT NULL
            );
            INSERT INTO sessions (id, created_at, updated_at)
            VALUES ('a', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z'),
                   ('b', '2025-01-02T00:00:00Z', '2025-01-02T00:00:00Z'),
                   ('c', '2025-01-03T00:00:00Z', '2025-01-03T00:00:00Z');",
        )
        .unwrap();
        // Stamp a v1 version so init_schema runs the migration path.
        conn.execute_batch(
            "CREATE TABLE schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);
             INSERT INTO schema_version (id, version) VALUES (1, 1);",
        )
        .unwrap();

        init_schema(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        let numbers: Vec<i64> = conn
            .prepare("SELECT number FROM sessions ORDER BY created_at")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(numbers, vec![1, 2, 3], "numbers must be dense from 1");
    }

    #[test]
    fn fts_triggers_track_insert_update_delete() {
        let conn = mem_conn();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO sessions (id, number, created_at, updated_at)
             VALUES ('s', 1, '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');
             INSERT INTO messages (session_id, role, parts, extracted_text, created_at, sequence)
             VALUES ('s', 'user', '[]', 'the quick brown fox', '2025-01-01T00:00:00Z', 0);",
        )
        .unwrap();

        let hits = |q: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH ?1",
                [q],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(hits("fox"), 1);

        conn.execute(
            "UPDATE messages SET extracted_text = 'lazy dog' WHERE session_id = 's'",
            [],
        )
        .unwrap();
        assert_eq!(hits("fox"), 0);
        assert_eq!(hits("dog"), 1);

        conn.execute("DELETE FROM messages WHERE session_id = 's'", [])
            .unwrap();
        assert_eq!(hits("dog"), 0);
    }
}
