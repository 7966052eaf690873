// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

use quill_model::Message;

use crate::error::Result;
use crate::types::{ListOptions, MetricsDelta, SearchHit, Session, SessionStatus, SessionSummary};
use crate::SessionStore;

/// Decorator that logs store failures at most once per operation name per
/// process, so a persistently broken database cannot flood the log while
/// the UI keeps running best-effort. Results pass through unchanged.
pub struct LoggingStore<S> {
    inner: S,
    warned: Mutex<HashSet<&'static str>>,
}

impl<S: SessionStore> LoggingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn observe<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            let mut warned = self.warned.lock().expect("logging store lock poisoned");
            if warned.insert(op) {
                warn!(op, error = %e, "store operation failed (suppressing further logs for this op)");
            }
        }
        result
    }
}

impl<S: SessionStore> SessionStore for LoggingStore<S> {
    fn create(&self, session: &mut Session) -> Result<()> {
        let r = self.inner.create(session);
        self.observe("create", r)
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        let r = self.inner.get(id);
        self.observe("get", r)
    }

    fn get_by_number(&self, number: i64) -> Result<Option<Session>> {
        let r = self.inner.get_by_number(number);
        self.observe("get_by_number", r)
    }

    fn get_by_prefix(&self, prefix: &str) -> Result<Option<Session>> {
        let r = self.inner.get_by_prefix(prefix);
        self.observe("get_by_prefix", r)
    }

    fn update(&self, session: &Session) -> Result<()> {
        let r = self.inner.update(session);
        self.observe("update", r)
    }

    fn update_metrics(&self, id: &str, delta: &MetricsDelta) -> Result<()> {
        let r = self.inner.update_metrics(id, delta);
        self.observe("update_metrics", r)
    }

    fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let r = self.inner.update_status(id, status);
        self.observe("update_status", r)
    }

    fn increment_user_turns(&self, id: &str) -> Result<()> {
        let r = self.inner.increment_user_turns(id);
        self.observe("increment_user_turns", r)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let r = self.inner.delete(id);
        self.observe("delete", r)
    }

    fn list(&self, opts: &ListOptions) -> Result<Vec<SessionSummary>> {
        let r = self.inner.list(opts);
        self.observe("list", r)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let r = self.inner.search(query, limit);
        self.observe("search", r)
    }

    fn add_message(&self, session_id: &str, msg: &mut Message) -> Result<()> {
        let r = self.inner.add_message(session_id, msg);
        self.observe("add_message", r)
    }

    fn replace_messages(&self, session_id: &str, msgs: &mut [Message]) -> Result<()> {
        let r = self.inner.replace_messages(session_id, msgs);
        self.observe("replace_messages", r)
    }

    fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let r = self.inner.get_messages(session_id, limit, offset);
        self.observe("get_messages", r)
    }

    fn set_current(&self, id: &str) -> Result<()> {
        let r = self.inner.set_current(id);
        self.observe("set_current", r)
    }

    fn get_current(&self) -> Result<Option<String>> {
        let r = self.inner.get_current();
        self.observe("get_current", r)
    }

    fn clear_current(&self) -> Result<()> {
        let r = self.inner.clear_current();
        self.observe("clear_current", r)
    }

    fn close(&self) -> Result<()> {
        let r = self.inner.close();
        self.observe("close", r)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
