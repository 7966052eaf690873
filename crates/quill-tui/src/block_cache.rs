// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::markdown::StyledLines;

/// A pre-rendered message at a specific width.
#[derive(Debug, Clone)]
pub struct MessageBlock {
    pub message_id: i64,
    pub lines: StyledLines,
    pub width: u16,
}

impl MessageBlock {
    pub fn height(&self) -> usize {
        self.lines.len()
    }
}

/// Bounded LRU of rendered message blocks keyed by `"<message_id>:<width>"`.
///
/// Shared between the renderer and the driver; the lock is per-operation.
/// Clients invalidate wholesale on width change and on any message-list
/// change — a block rendered before a sibling tool result existed would
/// otherwise survive with stale content.
pub struct BlockCache {
    inner: Mutex<lru::LruCache<String, Arc<MessageBlock>>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero after max");
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    /// Capacity proportional to the terminal height, clamped to [50, 200].
    pub fn capacity_for_height(height: u16) -> usize {
        (3 * height as usize / 5).clamp(50, 200)
    }

    pub fn key(message_id: i64, width: u16) -> String {
        format!("{message_id}:{width}")
    }

    /// Fetch and promote to most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<MessageBlock>> {
        self.inner.lock().expect("block cache lock poisoned").get(key).cloned()
    }

    /// Insert or replace (replacement also promotes); evicts the least
    /// recently used entry when at capacity.
    pub fn put(&self, key: String, block: Arc<MessageBlock>) {
        self.inner
            .lock()
            .expect("block cache lock poisoned")
            .put(key, block);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<MessageBlock>> {
        self.inner.lock().expect("block cache lock poisoned").pop(key)
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().expect("block cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("block cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("block cache lock poisoned").cap().get()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::text::Line;

    fn block(id: i64, width: u16) -> Arc<MessageBlock> {
        Arc::new(MessageBlock {
            message_id: id,
            lines: vec![Line::raw(format!("block {id}"))],
            width,
        })
    }

    #[test]
    fn put_then_get_returns_value() {
        let cache = BlockCache::new(4);
        cache.put(BlockCache::key(1, 80), block(1, 80));
        let got = cache.get(&BlockCache::key(1, 80)).unwrap();
        assert_eq!(got.message_id, 1);
        assert_eq!(got.height(), 1);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = BlockCache::new(2);
        cache.put("a".into(), block(1, 80));
        cache.put("b".into(), block(2, 80));
        cache.put("c".into(), block(3, 80));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none(), "oldest entry evicted");
    }

    #[test]
    fn get_promotes_entry() {
        let cache = BlockCache::new(2);
        cache.put("a".into(), block(1, 80));
        cache.put("b".into(), block(2, 80));
        let _ = cache.get("a"); // a becomes most recent
        cache.put("c".into(), block(3, 80));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn put_replaces_existing_key() {
        let cache = BlockCache::new(2);
        cache.put("a".into(), block(1, 80));
        cache.put("a".into(), block(9, 80));
        assert_eq!(cache.get("a").unwrap().message_id, 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_all_clears_every_key() {
        let cache = BlockCache::new(8);
        for i in 0..5 {
            cache.put(BlockCache::key(i, 80), block(i, 80));
        }
        cache.invalidate_all();
        assert!(cache.is_empty());
        for i in 0..5 {
            assert!(cache.get(&BlockCache::key(i, 80)).is_none());
        }
    }

    #[test]
    fn capacity_for_height_is_clamped() {
        assert_eq!(BlockCache::capacity_for_height(10), 50);
        assert_eq!(BlockCache::capacity_for_height(100), 60);
        assert_eq!(BlockCache::capacity_for_height(1000), 200);
    }
}
