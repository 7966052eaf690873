// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist. Lookups return `Ok(None)`
    /// instead; this is only produced by operations that assert existence
    /// (update, delete).
    #[error("not found")]
    NotFound,

    /// Database contention that survived all retry attempts.
    #[error("database busy: {0}")]
    Busy(String),

    /// A constraint violation (e.g. duplicate sequence). Recovered locally
    /// by retry where possible; surfacing one indicates a bug.
    #[error("constraint violated: {0}")]
    Conflict(String),

    /// The database could not be opened or the connection was lost.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Message parts failed to (de)serialize.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// True when the underlying SQLite error is lock contention that a retry
/// with backoff may resolve.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// True when the underlying SQLite error is a uniqueness/constraint failure.
pub fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
