// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent session and message store.
//!
//! One process owns the store. A single SQLite connection sits behind a
//! `Mutex`; contention with other connections (e.g. a read-only inspector)
//! is absorbed by the database busy timeout plus application-level retries.

mod db;
mod error;
mod logging;
mod null;
mod sqlite;
mod types;

pub use db::SCHEMA_VERSION;
pub use error::{Result, StoreError};
pub use logging::LoggingStore;
pub use null::NullStore;
pub use sqlite::{default_db_path, SqliteStore, StoreOptions};
pub use types::{
    ListOptions, MetricsDelta, SearchHit, Session, SessionMetrics, SessionStatus, SessionSummary,
};

use quill_model::Message;

/// Storage contract shared by the SQLite store, the null store, and the
/// logging decorator.
///
/// Lookups return `Ok(None)` when the entity is absent; only operations that
/// assert existence (update, delete) fail with [`StoreError::NotFound`].
pub trait SessionStore: Send + Sync {
    /// Persist a new session. Fills unset `id` and timestamps, forces
    /// `status = active`, and atomically assigns the next `number`.
    fn create(&self, session: &mut Session) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Session>>;

    fn get_by_number(&self, number: i64) -> Result<Option<Session>>;

    /// Resolve `#N`, a plain integer, an exact id, then a short-id prefix,
    /// in that order.
    fn get_by_prefix(&self, prefix: &str) -> Result<Option<Session>>;

    /// Rewrite mutable session fields and refresh `updated_at`.
    fn update(&self, session: &Session) -> Result<()>;

    /// Additive metrics update in one statement.
    fn update_metrics(&self, id: &str, delta: &MetricsDelta) -> Result<()>;

    fn update_status(&self, id: &str, status: SessionStatus) -> Result<()>;

    fn increment_user_turns(&self, id: &str) -> Result<()>;

    /// Delete the session and (by cascade) its messages.
    fn delete(&self, id: &str) -> Result<()>;

    fn list(&self, opts: &ListOptions) -> Result<Vec<SessionSummary>>;

    /// Ranked full-text search with `**…**`-highlighted snippets.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Insert a message. When `msg.sequence < 0` the next dense sequence is
    /// allocated inside the same transaction; the session's `updated_at` is
    /// bumped. On return `msg.id`, `msg.sequence`, and `msg.session_id` are
    /// populated.
    fn add_message(&self, session_id: &str, msg: &mut Message) -> Result<()>;

    /// Transactional delete-and-reinsert with dense sequences from 0.
    /// Used by compaction.
    fn replace_messages(&self, session_id: &str, msgs: &mut [Message]) -> Result<()>;

    /// Messages ordered by ascending sequence. `limit == 0` means no limit.
    fn get_messages(&self, session_id: &str, limit: usize, offset: usize)
        -> Result<Vec<Message>>;

    fn set_current(&self, id: &str) -> Result<()>;
    fn get_current(&self) -> Result<Option<String>>;
    fn clear_current(&self) -> Result<()>;

    /// Release the connection. Subsequent calls are undefined.
    fn close(&self) -> Result<()>;
}
