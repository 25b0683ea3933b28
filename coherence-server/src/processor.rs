//! Request Processor
//!
//! [`CoherenceServer`] owns the access directory, the value store, the node
//! registry and the applied-request feed. It exposes the update queue
//! operations through [`UpdateQueueServer`] for in-process callers, and
//! [`CoherenceServer::process`] for channels, which binds each decoded
//! request to the session it arrived on.

use crate::directory::AccessDirectory;
use crate::events::{AppliedFeed, AppliedOutcome, AppliedRequest};
use crate::registry::{NodeRegistry, NodeSession};
use crate::store::ValueStore;
use bytes::Bytes;
use coherence_core::{
    BindingKey, CoherenceConfig, CoherenceError, CoherenceResult, Key, NodeId, ObjectId,
    ValidationError,
};
use coherence_wire::{CommitBatch, Request};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ============================================================================
// SERVER OPERATIONS
// ============================================================================

/// Operations a node's update queue drives on the server.
///
/// Each call either completes, fails with a consistency fault, or fails with
/// an input-validation error. None of them closes anything.
pub trait UpdateQueueServer: Send + Sync {
    /// Apply a batch of writes on behalf of `node_id`, all or nothing.
    fn commit(&self, node_id: NodeId, batch: &CommitBatch) -> CoherenceResult<()>;

    fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> CoherenceResult<()>;

    fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> CoherenceResult<()>;

    fn evict_binding(&self, node_id: NodeId, key: &BindingKey) -> CoherenceResult<()>;

    fn downgrade_binding(&self, node_id: NodeId, key: &BindingKey) -> CoherenceResult<()>;

    /// Commit from the four parallel arrays of the wire form.
    ///
    /// Mismatched lengths, negative ids and out-of-range name values are
    /// validation errors.
    fn commit_arrays(
        &self,
        node_id: NodeId,
        oids: Vec<i64>,
        oid_values: Vec<Option<Bytes>>,
        names: Vec<Option<String>>,
        name_values: Vec<i64>,
    ) -> CoherenceResult<()> {
        let batch = CommitBatch::from_arrays(oids, oid_values, names, name_values)?;
        self.commit(node_id, &batch)
    }
}

/// Result of processing one request on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRequest {
    pub sequence: u64,
    pub outcome: Result<(), CoherenceError>,
}

// ============================================================================
// COHERENCE SERVER
// ============================================================================

/// The coherence authority.
pub struct CoherenceServer<S: ValueStore> {
    config: CoherenceConfig,
    directory: AccessDirectory,
    store: Arc<S>,
    registry: NodeRegistry,
    feed: AppliedFeed,
}

impl<S: ValueStore> CoherenceServer<S> {
    /// Create a server with an empty directory and registry.
    pub fn new(config: CoherenceConfig, store: Arc<S>) -> CoherenceResult<Self> {
        config.validate()?;
        Ok(Self {
            directory: AccessDirectory::from_config(&config),
            feed: AppliedFeed::new(config.applied_feed_capacity),
            registry: NodeRegistry::new(),
            store,
            config,
        })
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// The authoritative directory. Grants go through here.
    pub fn directory(&self) -> &AccessDirectory {
        &self.directory
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn subscribe_applied(&self) -> broadcast::Receiver<AppliedRequest> {
        self.feed.subscribe()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub fn register_node(&self, node_id: NodeId) -> CoherenceResult<Arc<NodeSession>> {
        let session = self.registry.register(node_id)?;
        info!(
            node_id = node_id.as_i64(),
            session_id = %session.session_id(),
            "Node registered"
        );
        Ok(session)
    }

    /// Unregister `node_id` and release everything it held.
    ///
    /// The node cannot register again until the release is done.
    pub fn unregister_node(&self, node_id: NodeId) -> CoherenceResult<()> {
        let (_, released) = self
            .registry
            .unregister_with(node_id, |session| self.release(session))?;
        released
    }

    /// End `session` if it is still live; a newer registration of the same
    /// node is left alone.
    pub fn close_session(&self, session: &NodeSession) -> CoherenceResult<()> {
        self.registry
            .unregister_session_with(session, |live| self.release(live))
            .unwrap_or(Ok(()))
    }

    fn release(&self, session: &NodeSession) -> CoherenceResult<()> {
        let released = self.directory.release_node(session.node_id())?;
        info!(
            node_id = session.node_id().as_i64(),
            session_id = %session.session_id(),
            released,
            "Node unregistered"
        );
        Ok(())
    }

    /// Fail every live session and clear its directory holdings.
    pub fn shutdown(&self) {
        let sessions = self.registry.shutdown_all(|session| {
            if let Err(e) = self.release(session) {
                warn!(node_id = session.node_id().as_i64(), error = %e, "Release failed during shutdown");
            }
        });
        info!(sessions = sessions.len(), "Coherence server shut down");
    }

    // ========================================================================
    // PROCESSING
    // ========================================================================

    /// Apply one request from `session`'s channel.
    ///
    /// Assigns the session's next sequence, records the outcome and publishes
    /// it on the applied feed. Concurrent callers for one session take turns,
    /// so sequences and the feed follow the order requests were applied in.
    pub fn process(&self, session: &NodeSession, request: Request) -> ProcessedRequest {
        let _turn = session.take_turn();
        let node_id = session.node_id();
        let kind = request.kind();
        let keys = request.keys();

        let outcome = self.apply(node_id, &request);
        let sequence = session.next_sequence();

        match &outcome {
            Ok(()) => debug!(
                node_id = node_id.as_i64(),
                sequence,
                kind = kind.as_str(),
                keys = keys.len(),
                "Applied request"
            ),
            Err(CoherenceError::Consistency(fault)) => {
                session.record_consistency_fault();
                warn!(
                    node_id = node_id.as_i64(),
                    sequence,
                    kind = kind.as_str(),
                    error = %fault,
                    "Consistency fault"
                );
            }
            Err(e) => {
                session.record_rejection();
                warn!(
                    node_id = node_id.as_i64(),
                    sequence,
                    kind = kind.as_str(),
                    error = %e,
                    "Request rejected"
                );
            }
        }

        self.feed.publish(AppliedRequest {
            node_id,
            session_id: session.session_id(),
            sequence,
            kind,
            keys,
            outcome: AppliedOutcome::from_result(&outcome),
            applied_at: chrono::Utc::now(),
        });

        ProcessedRequest { sequence, outcome }
    }

    fn apply(&self, node_id: NodeId, request: &Request) -> CoherenceResult<()> {
        match request {
            Request::Commit(batch) => self.apply_commit(node_id, batch),
            Request::EvictObject { oid } => self.directory.evict(&Key::Object(*oid), node_id),
            Request::DowngradeObject { oid } => {
                self.directory.downgrade(&Key::Object(*oid), node_id)
            }
            Request::EvictBinding { key } => {
                self.directory.evict(&Key::Binding(key.clone()), node_id)
            }
            Request::DowngradeBinding { key } => {
                self.directory.downgrade(&Key::Binding(key.clone()), node_id)
            }
        }
    }

    fn apply_commit(&self, node_id: NodeId, batch: &CommitBatch) -> CoherenceResult<()> {
        self.check_batch(batch)?;
        let keys = batch.keys();
        self.directory
            .commit_with(node_id, &keys, || self.store.apply(batch))
    }

    fn check_batch(&self, batch: &CommitBatch) -> Result<(), ValidationError> {
        let len = batch.objects.len().max(batch.bindings.len());
        if len > self.config.max_batch_len {
            return Err(ValidationError::LimitExceeded {
                field: "commit batch".to_string(),
                len,
                max: self.config.max_batch_len,
            });
        }
        Ok(())
    }

    /// Run a direct call for a registered node through the same path as a
    /// channel request, so it is sequenced and published.
    fn call(&self, node_id: NodeId, request: Request) -> CoherenceResult<()> {
        let session = self.registry.session(node_id)?;
        self.process(&session, request).outcome
    }
}

impl<S: ValueStore> UpdateQueueServer for CoherenceServer<S> {
    fn commit(&self, node_id: NodeId, batch: &CommitBatch) -> CoherenceResult<()> {
        self.call(node_id, Request::Commit(batch.clone()))
    }

    fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> CoherenceResult<()> {
        self.call(node_id, Request::EvictObject { oid })
    }

    fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> CoherenceResult<()> {
        self.call(node_id, Request::DowngradeObject { oid })
    }

    fn evict_binding(&self, node_id: NodeId, key: &BindingKey) -> CoherenceResult<()> {
        self.call(node_id, Request::EvictBinding { key: key.clone() })
    }

    fn downgrade_binding(&self, node_id: NodeId, key: &BindingKey) -> CoherenceResult<()> {
        self.call(node_id, Request::DowngradeBinding { key: key.clone() })
    }
}

impl<S: ValueStore> std::fmt::Debug for CoherenceServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceServer")
            .field("config", &self.config)
            .field("nodes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
