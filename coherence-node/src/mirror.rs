//! Local cache mirror
//!
//! What a node believes it holds, per key. The server's directory is
//! authoritative; the mirror only lets the node decide what it may evict or
//! downgrade without asking. It is cleared when the node's channel fails,
//! since the node must then rebuild its cache from scratch.

use coherence_core::{AccessLevel, Key};
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct CacheMirror {
    entries: DashMap<Key, AccessLevel>,
}

impl CacheMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a grant received from the server.
    pub fn record_grant(&self, key: Key, level: AccessLevel) {
        self.entries.insert(key, level);
    }

    pub fn level(&self, key: &Key) -> Option<AccessLevel> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn may_write(&self, key: &Key) -> bool {
        self.level(key) == Some(AccessLevel::Write)
    }

    /// Forget `key`. Returns the level that was held.
    pub fn evict(&self, key: &Key) -> Option<AccessLevel> {
        self.entries.remove(key).map(|(_, level)| level)
    }

    /// Weaken `key` to read. Returns false if it was not held for write.
    pub fn downgrade(&self, key: &Key) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if *entry.value() == AccessLevel::Write => {
                *entry.value_mut() = AccessLevel::Read;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
