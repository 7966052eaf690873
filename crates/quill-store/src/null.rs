// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_model::{join_text_parts, Message};

use crate::error::Result;
use crate::types::{ListOptions, MetricsDelta, SearchHit, Session, SessionStatus, SessionSummary};
use crate::SessionStore;

/// Store used when persistence is disabled. Every method succeeds and
/// returns empty results; `create` still assigns an id so the rest of the
/// pipeline can key on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl SessionStore for NullStore {
    fn create(&self, session: &mut Session) -> Result<()> {
        if session.id.is_empty() {
            session.id = uuid::Uuid::new_v4().to_string();
        }
        session.status = SessionStatus::Active;
        Ok(())
    }

    fn get(&self, _id: &str) -> Result<Option<Session>> {
        Ok(None)
    }

    fn get_by_number(&self, _number: i64) -> Result<Option<Session>> {
        Ok(None)
    }

    fn get_by_prefix(&self, _prefix: &str) -> Result<Option<Session>> {
        Ok(None)
    }

    fn update(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn update_metrics(&self, _id: &str, _delta: &MetricsDelta) -> Result<()> {
        Ok(())
    }

    fn update_status(&self, _id: &str, _status: SessionStatus) -> Result<()> {
        Ok(())
    }

    fn increment_user_turns(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn list(&self, _opts: &ListOptions) -> Result<Vec<SessionSummary>> {
        Ok(Vec::new())
    }

    fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    fn add_message(&self, session_id: &str, msg: &mut Message) -> Result<()> {
        msg.session_id = session_id.to_string();
        msg.extracted_text = join_text_parts(&msg.parts);
        Ok(())
    }

    fn replace_messages(&self, _session_id: &str, _msgs: &mut [Message]) -> Result<()> {
        Ok(())
    }

    fn get_messages(
        &self,
        _session_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    fn set_current(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn get_current(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn clear_current(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_id_but_nothing_persists() {
        let store = NullStore;
        let mut session = Session::new();
        session.id.clear();
        store.create(&mut session).unwrap();
        assert!(!session.id.is_empty());
        assert!(store.get(&session.id).unwrap().is_none());
    }

    #[test]
    fn all_lookups_return_empty() {
        let store = NullStore;
        assert!(store.get_by_prefix("#1").unwrap().is_none());
        assert!(store.list(&ListOptions::default()).unwrap().is_empty());
        assert!(store.search("anything", 10).unwrap().is_empty());
        assert!(store.get_current().unwrap().is_none());
    }
}
