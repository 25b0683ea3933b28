//! Node Registry
//!
//! Explicit table of registered nodes, owned by the server. A node must be
//! registered before any request bearing its id is accepted. Each
//! registration is a [`NodeSession`]: it carries the per-node applied
//! sequence, counters, and the shutdown signal that ends the node's channel.

use coherence_core::{new_session_id, NodeId, SessionId, Timestamp, ValidationError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

// ============================================================================
// SESSION
// ============================================================================

/// One live registration of a node.
#[derive(Debug)]
pub struct NodeSession {
    node_id: NodeId,
    session_id: SessionId,
    registered_at: Timestamp,
    last_sequence: AtomicU64,
    consistency_faults: AtomicU64,
    rejected: AtomicU64,
    channel_attached: AtomicBool,
    /// Held while one request is applied and sequenced.
    turn: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Point-in-time counters of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub node_id: NodeId,
    pub session_id: SessionId,
    pub registered_at: Timestamp,
    /// Requests processed so far; equals the last assigned sequence.
    pub processed: u64,
    pub consistency_faults: u64,
    pub rejected: u64,
    pub shut_down: bool,
}

impl NodeSession {
    fn new(node_id: NodeId) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id,
            session_id: new_session_id(),
            registered_at: chrono::Utc::now(),
            last_sequence: AtomicU64::new(0),
            consistency_faults: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            channel_attached: AtomicBool::new(false),
            turn: Mutex::new(()),
            shutdown_tx,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn registered_at(&self) -> Timestamp {
        self.registered_at
    }

    /// Take the session's turn to apply a request. Requests of one session
    /// are applied and sequenced one at a time, in the order they get here.
    pub(crate) fn take_turn(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock has nothing to repair.
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next applied sequence. The first request gets 1.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_consistency_fault(&self) {
        self.consistency_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the session's single channel reader.
    pub fn attach_channel(&self) -> Result<(), ValidationError> {
        if self.channel_attached.swap(true, Ordering::SeqCst) {
            return Err(ValidationError::InvalidValue {
                field: "node_id".to_string(),
                reason: format!("node {} already has a channel", self.node_id),
            });
        }
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal the session's channel to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            node_id: self.node_id,
            session_id: self.session_id,
            registered_at: self.registered_at,
            processed: self.last_sequence.load(Ordering::SeqCst),
            consistency_faults: self.consistency_faults.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            shut_down: self.is_shut_down(),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Table of live sessions keyed by node id.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    sessions: DashMap<NodeId, Arc<NodeSession>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id`. Fails if the node already has a live session.
    pub fn register(&self, node_id: NodeId) -> Result<Arc<NodeSession>, ValidationError> {
        match self.sessions.entry(node_id) {
            Entry::Occupied(_) => Err(ValidationError::AlreadyRegistered { node_id }),
            Entry::Vacant(slot) => {
                let session = Arc::new(NodeSession::new(node_id));
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Remove and shut down the session of `node_id`.
    pub fn unregister(&self, node_id: NodeId) -> Result<Arc<NodeSession>, ValidationError> {
        self.unregister_with(node_id, |_| ()).map(|(session, ())| session)
    }

    /// Shut down the session of `node_id` and run `release` on it before the
    /// entry is removed.
    ///
    /// The entry stays locked while `release` runs, so the node cannot
    /// register again until its old holdings are gone. `release` must not
    /// touch this registry.
    pub fn unregister_with<R>(
        &self,
        node_id: NodeId,
        release: impl FnOnce(&NodeSession) -> R,
    ) -> Result<(Arc<NodeSession>, R), ValidationError> {
        match self.sessions.entry(node_id) {
            Entry::Vacant(_) => Err(ValidationError::UnregisteredNode { node_id }),
            Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                session.shutdown();
                let released = release(&session);
                entry.remove();
                Ok((session, released))
            }
        }
    }

    /// Remove `session` only if it is still the node's live registration.
    ///
    /// Returns false when the node has since re-registered.
    pub fn unregister_session(&self, session: &NodeSession) -> bool {
        self.unregister_session_with(session, |_| ()).is_some()
    }

    /// Like [`unregister_with`](Self::unregister_with), but only when
    /// `session` is still the node's live registration. Returns `None`, and
    /// leaves the newer registration alone, otherwise.
    pub fn unregister_session_with<R>(
        &self,
        session: &NodeSession,
        release: impl FnOnce(&NodeSession) -> R,
    ) -> Option<R> {
        session.shutdown();
        match self.sessions.entry(session.node_id()) {
            Entry::Occupied(entry) if entry.get().session_id() == session.session_id() => {
                let released = release(entry.get());
                entry.remove();
                Some(released)
            }
            _ => None,
        }
    }

    pub fn session(&self, node_id: NodeId) -> Result<Arc<NodeSession>, ValidationError> {
        self.sessions
            .get(&node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ValidationError::UnregisteredNode { node_id })
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.sessions.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Shut down and remove every session, running `release` on each before
    /// its entry is removed.
    pub fn shutdown_all(
        &self,
        mut release: impl FnMut(&NodeSession),
    ) -> Vec<Arc<NodeSession>> {
        self.node_ids()
            .into_iter()
            .filter_map(|node_id| {
                self.unregister_with(node_id, &mut release)
                    .ok()
                    .map(|(session, ())| session)
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
