//! Access Directory
//!
//! Authoritative map from [`Key`] to [`AccessState`]. Keys are spread over a
//! fixed number of shards by hash, each behind its own `RwLock`, so
//! operations on unrelated keys do not contend.
//!
//! Locking discipline:
//! - evict, downgrade and grants take one shard write lock.
//! - commit takes read locks on every shard its batch touches, in ascending
//!   shard index, validates the whole batch, then runs the apply step before
//!   releasing them. Since single-key transitions need the write lock, no
//!   transition on a committed key can interleave between validation and
//!   apply.
//!
//! Entries are created on first grant and removed once they fall back to
//! `Unheld`.

use coherence_core::{
    AccessLevel, AccessState, CoherenceConfig, CoherenceResult, ConsistencyFault, DirectoryEntry,
    DirectoryError, Key, NodeId,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Shard = HashMap<Key, AccessState>;

/// Sharded key-to-access-state table.
#[derive(Debug)]
pub struct AccessDirectory {
    shards: Vec<RwLock<Shard>>,
}

impl Default for AccessDirectory {
    fn default() -> Self {
        Self::from_config(&CoherenceConfig::default())
    }
}

impl AccessDirectory {
    /// Create a directory with `shards` shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| RwLock::new(Shard::new())).collect();
        Self { shards }
    }

    pub fn from_config(config: &CoherenceConfig) -> Self {
        Self::new(config.directory_shards)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &Key) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn read_shard(&self, index: usize) -> Result<RwLockReadGuard<'_, Shard>, DirectoryError> {
        self.shards[index]
            .read()
            .map_err(|_| DirectoryError::LockPoisoned)
    }

    fn write_shard(&self, index: usize) -> Result<RwLockWriteGuard<'_, Shard>, DirectoryError> {
        self.shards[index]
            .write()
            .map_err(|_| DirectoryError::LockPoisoned)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Snapshot of the access state of `key`.
    pub fn state(&self, key: &Key) -> Result<AccessState, DirectoryError> {
        let shard = self.read_shard(self.shard_index(key))?;
        Ok(shard.get(key).cloned().unwrap_or_default())
    }

    pub fn holders(&self, key: &Key) -> Result<BTreeSet<NodeId>, DirectoryError> {
        Ok(self.state(key)?.holders())
    }

    /// Number of keys held by at least one node.
    pub fn entry_count(&self) -> Result<usize, DirectoryError> {
        let mut count = 0;
        for index in 0..self.shards.len() {
            count += self.read_shard(index)?.len();
        }
        Ok(count)
    }

    /// Every held key with its state, ordered by key.
    pub fn entries(&self) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let mut entries = Vec::new();
        for index in 0..self.shards.len() {
            let shard = self.read_shard(index)?;
            entries.extend(shard.iter().map(|(key, state)| DirectoryEntry {
                key: key.clone(),
                state: state.clone(),
            }));
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    // ========================================================================
    // GRANTS
    // ========================================================================

    /// Record that `node` may read `key`.
    pub fn grant_read(&self, key: Key, node: NodeId) -> Result<(), DirectoryError> {
        self.grant(key, node, AccessLevel::Read)
    }

    /// Record that `node` may write `key`. Upgrades a sole reader.
    pub fn grant_write(&self, key: Key, node: NodeId) -> Result<(), DirectoryError> {
        self.grant(key, node, AccessLevel::Write)
    }

    fn grant(&self, key: Key, node: NodeId, level: AccessLevel) -> Result<(), DirectoryError> {
        let mut shard = self.write_shard(self.shard_index(&key))?;
        let current = shard.get(&key).cloned().unwrap_or_default();
        let granted = match level {
            AccessLevel::Read => current.granted_read(node),
            AccessLevel::Write => current.granted_write(node),
        };
        match granted {
            Ok(next) => {
                shard.insert(key, next);
                Ok(())
            }
            Err(holder) => Err(DirectoryError::AccessConflict {
                key,
                requested: level,
                node_id: node,
                holder,
            }),
        }
    }

    // ========================================================================
    // RELEASES
    // ========================================================================

    /// `node` gives up all access to `key`.
    pub fn evict(&self, key: &Key, node: NodeId) -> CoherenceResult<()> {
        let mut shard = self.write_shard(self.shard_index(key))?;
        let current = shard.get(key).cloned().unwrap_or_default();
        match current.evicted(node) {
            Some(AccessState::Unheld) => {
                shard.remove(key);
                Ok(())
            }
            Some(next) => {
                shard.insert(key.clone(), next);
                Ok(())
            }
            None => Err(ConsistencyFault::NotHeld {
                node_id: node,
                key: key.clone(),
                recorded: current,
            }
            .into()),
        }
    }

    /// The writer `node` weakens its access to `key` to read.
    pub fn downgrade(&self, key: &Key, node: NodeId) -> CoherenceResult<()> {
        let mut shard = self.write_shard(self.shard_index(key))?;
        let current = shard.get(key).cloned().unwrap_or_default();
        match current.downgraded(node) {
            Some(next) => {
                shard.insert(key.clone(), next);
                Ok(())
            }
            None => Err(ConsistencyFault::NotWriter {
                node_id: node,
                key: key.clone(),
                recorded: current,
            }
            .into()),
        }
    }

    /// Remove `node` from every entry. Returns the number of entries touched.
    pub fn release_node(&self, node: NodeId) -> Result<usize, DirectoryError> {
        let mut touched = 0;
        for index in 0..self.shards.len() {
            let mut shard = self.write_shard(index)?;
            shard.retain(|_, state| match state.evicted(node) {
                Some(AccessState::Unheld) => {
                    touched += 1;
                    false
                }
                Some(next) => {
                    touched += 1;
                    *state = next;
                    true
                }
                None => true,
            });
        }
        Ok(touched)
    }

    // ========================================================================
    // COMMIT
    // ========================================================================

    /// Validate that `node` holds write access to every key in `keys`, then
    /// run `apply` while the keys' shards are still locked.
    ///
    /// Nothing is applied if any key fails validation. Access state is left
    /// unchanged either way.
    pub fn commit_with<T, F>(&self, node: NodeId, keys: &[Key], apply: F) -> CoherenceResult<T>
    where
        F: FnOnce() -> CoherenceResult<T>,
    {
        let indices: BTreeSet<usize> = keys.iter().map(|key| self.shard_index(key)).collect();

        let mut guards: HashMap<usize, RwLockReadGuard<'_, Shard>> =
            HashMap::with_capacity(indices.len());
        for index in indices {
            guards.insert(index, self.read_shard(index)?);
        }

        for key in keys {
            let index = self.shard_index(key);
            let recorded = guards
                .get(&index)
                .and_then(|shard| shard.get(key))
                .cloned()
                .unwrap_or_default();
            if recorded.writer() != Some(node) {
                return Err(ConsistencyFault::CommitWithoutWrite {
                    node_id: node,
                    key: key.clone(),
                    recorded,
                }
                .into());
            }
        }

        let result = apply();
        drop(guards);
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_core::{BindingKey, CoherenceError, ObjectId};

    fn node(raw: i64) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn object(raw: i64) -> Key {
        Key::object(ObjectId::new(raw).unwrap())
    }

    #[test]
    fn test_grant_read_is_shared() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(1), node(1)).unwrap();
        dir.grant_read(object(1), node(2)).unwrap();
        assert_eq!(
            dir.holders(&object(1)).unwrap(),
            BTreeSet::from([node(1), node(2)])
        );
    }

    #[test]
    fn test_grant_write_conflicts_with_other_reader() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(1), node(1)).unwrap();
        let err = dir.grant_write(object(1), node(2)).unwrap_err();
        assert_eq!(
            err,
            DirectoryError::AccessConflict {
                key: object(1),
                requested: AccessLevel::Write,
                node_id: node(2),
                holder: node(1),
            }
        );
        assert_eq!(
            dir.state(&object(1)).unwrap(),
            AccessState::ReadShared(BTreeSet::from([node(1)]))
        );
    }

    #[test]
    fn test_grant_write_upgrades_sole_reader() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(1), node(1)).unwrap();
        dir.grant_write(object(1), node(1)).unwrap();
        assert_eq!(
            dir.state(&object(1)).unwrap(),
            AccessState::WriteExclusive(node(1))
        );
    }

    #[test]
    fn test_evict_not_held_is_fault_and_leaves_state() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(7), node(1)).unwrap();
        let before = dir.state(&object(7)).unwrap();

        let result = dir.evict(&object(7), node(2));
        assert!(matches!(
            result,
            Err(CoherenceError::Consistency(ConsistencyFault::NotHeld { .. }))
        ));
        assert_eq!(dir.state(&object(7)).unwrap(), before);
    }

    #[test]
    fn test_evict_last_reader_prunes_entry() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(7), node(1)).unwrap();
        dir.evict(&object(7), node(1)).unwrap();
        assert_eq!(dir.state(&object(7)).unwrap(), AccessState::Unheld);
        assert_eq!(dir.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_downgrade_reader_is_fault() {
        let dir = AccessDirectory::new(4);
        dir.grant_read(object(3), node(1)).unwrap();
        let result = dir.downgrade(&object(3), node(1));
        assert!(matches!(
            result,
            Err(CoherenceError::Consistency(ConsistencyFault::NotWriter { .. }))
        ));
    }

    #[test]
    fn test_downgrade_then_evict_binding() {
        let dir = AccessDirectory::new(4);
        let room = Key::binding("room1");
        dir.grant_write(room.clone(), node(1)).unwrap();

        dir.downgrade(&room, node(1)).unwrap();
        assert_eq!(
            dir.state(&room).unwrap(),
            AccessState::ReadShared(BTreeSet::from([node(1)]))
        );

        dir.evict(&room, node(1)).unwrap();
        assert_eq!(dir.state(&room).unwrap(), AccessState::Unheld);
    }

    #[test]
    fn test_upper_sentinel_is_an_ordinary_key() {
        let dir = AccessDirectory::new(4);
        let upper = Key::Binding(BindingKey::Upper);
        dir.grant_write(upper.clone(), node(2)).unwrap();
        dir.evict(&upper, node(2)).unwrap();
        assert_eq!(dir.state(&upper).unwrap(), AccessState::Unheld);
    }

    #[test]
    fn test_commit_requires_every_key() {
        let dir = AccessDirectory::new(4);
        dir.grant_write(object(5), node(1)).unwrap();

        let mut applied = false;
        let result = dir.commit_with(node(1), &[object(5), object(9)], || {
            applied = true;
            Ok(())
        });

        assert!(matches!(
            result,
            Err(CoherenceError::Consistency(
                ConsistencyFault::CommitWithoutWrite { .. }
            ))
        ));
        assert!(!applied);
    }

    #[test]
    fn test_commit_leaves_access_unchanged() {
        let dir = AccessDirectory::new(1);
        dir.grant_write(object(5), node(1)).unwrap();
        dir.grant_write(object(9), node(1)).unwrap();

        let value = dir
            .commit_with(node(1), &[object(5), object(9)], || Ok(42))
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(
            dir.state(&object(5)).unwrap(),
            AccessState::WriteExclusive(node(1))
        );
    }

    #[test]
    fn test_empty_commit_succeeds() {
        let dir = AccessDirectory::new(4);
        assert!(dir.commit_with(node(1), &[], || Ok(())).is_ok());
    }

    #[test]
    fn test_release_node_clears_all_holdings() {
        let dir = AccessDirectory::new(8);
        dir.grant_write(object(1), node(1)).unwrap();
        dir.grant_read(object(2), node(1)).unwrap();
        dir.grant_read(object(2), node(2)).unwrap();
        dir.grant_read(object(3), node(2)).unwrap();

        assert_eq!(dir.release_node(node(1)).unwrap(), 2);
        assert_eq!(dir.state(&object(1)).unwrap(), AccessState::Unheld);
        assert_eq!(
            dir.state(&object(2)).unwrap(),
            AccessState::ReadShared(BTreeSet::from([node(2)]))
        );
        assert_eq!(dir.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_entries_sorted_by_key() {
        let dir = AccessDirectory::new(16);
        dir.grant_read(Key::binding("b"), node(1)).unwrap();
        dir.grant_read(object(9), node(1)).unwrap();
        dir.grant_read(object(2), node(1)).unwrap();

        let keys: Vec<Key> = dir.entries().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![object(2), object(9), Key::binding("b")]);
    }

    #[test]
    fn test_zero_shards_clamped() {
        assert_eq!(AccessDirectory::new(0).shard_count(), 1);
    }
}
