//! Server-side value storage
//!
//! The directory decides whether a commit is allowed; the [`ValueStore`]
//! holds what the commit wrote. The server calls [`ValueStore::apply`] while
//! the batch's directory shards are still locked, so a concurrent grant can
//! never observe a half-applied batch.

use bytes::Bytes;
use coherence_core::{BindingKey, CoherenceResult, ObjectId, StorageError};
use coherence_wire::{BindingValue, CommitBatch, ObjectValue};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

/// Storage backend for committed object values and name bindings.
pub trait ValueStore: Send + Sync {
    /// Apply every write in the batch, all or nothing.
    fn apply(&self, batch: &CommitBatch) -> CoherenceResult<()>;

    /// Current value of an object.
    fn object(&self, oid: ObjectId) -> CoherenceResult<Option<Bytes>>;

    /// Object a name is bound to.
    fn binding(&self, name: &str) -> CoherenceResult<Option<ObjectId>>;

    /// First bound name strictly after `after`, or the upper sentinel when
    /// there is none.
    fn next_binding(&self, after: &BindingKey) -> CoherenceResult<BindingKey>;
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<ObjectId, Bytes>,
    bindings: BTreeMap<String, ObjectId>,
}

/// In-memory value store.
#[derive(Debug, Default)]
pub struct InMemoryValueStore {
    state: RwLock<StoreState>,
}

impl InMemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> CoherenceResult<usize> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.objects.len())
    }

    pub fn binding_count(&self) -> CoherenceResult<usize> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.bindings.len())
    }
}

impl ValueStore for InMemoryValueStore {
    fn apply(&self, batch: &CommitBatch) -> CoherenceResult<()> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;

        for write in &batch.objects {
            match &write.value {
                ObjectValue::Store(bytes) => {
                    state.objects.insert(write.oid, bytes.clone());
                }
                ObjectValue::Remove => {
                    state.objects.remove(&write.oid);
                }
            }
        }

        for write in &batch.bindings {
            match write.value {
                BindingValue::Bound(oid) => {
                    state.bindings.insert(write.name.clone(), oid);
                }
                BindingValue::Remove => {
                    state.bindings.remove(&write.name);
                }
            }
        }

        Ok(())
    }

    fn object(&self, oid: ObjectId) -> CoherenceResult<Option<Bytes>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.objects.get(&oid).cloned())
    }

    fn binding(&self, name: &str) -> CoherenceResult<Option<ObjectId>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.bindings.get(name).copied())
    }

    fn next_binding(&self, after: &BindingKey) -> CoherenceResult<BindingKey> {
        let name = match after {
            BindingKey::Name(name) => name.as_str(),
            BindingKey::Upper => return Ok(BindingKey::Upper),
        };
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        let next = state
            .bindings
            .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
            .next()
            .map(|(name, _)| BindingKey::name(name.clone()))
            .unwrap_or(BindingKey::Upper);
        Ok(next)
    }
}

// ============================================================================
// TESTS
// ============================================================================
