//! Coherence Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Proptest generators for ids, keys and requests
//! - Fixtures for common requests
//! - Assertions on coherence outcomes

// Re-export core types for convenience
pub use coherence_core::{
    AccessLevel, AccessState, BindingKey, ChannelError, CoherenceError, CoherenceResult,
    ConsistencyFault, Key, NodeId, ObjectId, ValidationError,
};
pub use coherence_wire::{CommitBatch, Request, RequestKind};

/// Node id from a literal. Panics on negative input.
#[track_caller]
pub fn node(raw: i64) -> NodeId {
    NodeId::new(raw).expect("test node ids are non-negative")
}

/// Object id from a literal. Panics on negative input.
#[track_caller]
pub fn oid(raw: i64) -> ObjectId {
    ObjectId::new(raw).expect("test object ids are non-negative")
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for coherence types.

    use super::*;
    use coherence_wire::{BindingValue, BindingWrite, ObjectValue, ObjectWrite};
    use proptest::prelude::*;

    /// Generate a NodeId from a small pool so operations collide.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        (0i64..4).prop_map(node)
    }

    /// Generate any valid ObjectId.
    pub fn arb_object_id() -> impl Strategy<Value = ObjectId> {
        (0i64..=i64::MAX).prop_map(oid)
    }

    /// Generate an ObjectId from a small pool so keys collide.
    pub fn arb_small_object_id() -> impl Strategy<Value = ObjectId> {
        (0i64..8).prop_map(oid)
    }

    /// Generate a binding name, including empty and non-ASCII names.
    pub fn arb_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "[a-z][a-z0-9_]{0,12}",
            "\\PC{0,8}",
        ]
    }

    /// Generate a BindingKey, sometimes the upper sentinel.
    pub fn arb_binding_key() -> impl Strategy<Value = BindingKey> {
        prop_oneof![
            4 => arb_name().prop_map(BindingKey::Name),
            1 => Just(BindingKey::Upper),
        ]
    }

    /// Generate a Key from small pools so keys collide.
    pub fn arb_small_key() -> impl Strategy<Value = Key> {
        prop_oneof![
            arb_small_object_id().prop_map(Key::Object),
            prop::sample::select(vec!["a", "b", "room1"]).prop_map(|name| Key::binding(name)),
        ]
    }

    pub fn arb_object_write() -> impl Strategy<Value = ObjectWrite> {
        (
            arb_object_id(),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        )
            .prop_map(|(oid, value)| ObjectWrite {
                oid,
                value: match value {
                    Some(bytes) => ObjectValue::Store(bytes.into()),
                    None => ObjectValue::Remove,
                },
            })
    }

    pub fn arb_binding_write() -> impl Strategy<Value = BindingWrite> {
        (arb_name(), prop::option::of(arb_object_id())).prop_map(|(name, target)| BindingWrite {
            name,
            value: match target {
                Some(oid) => BindingValue::Bound(oid),
                None => BindingValue::Remove,
            },
        })
    }

    pub fn arb_commit_batch() -> impl Strategy<Value = CommitBatch> {
        (
            prop::collection::vec(arb_object_write(), 0..6),
            prop::collection::vec(arb_binding_write(), 0..6),
        )
            .prop_map(|(objects, bindings)| CommitBatch { objects, bindings })
    }

    /// Generate any request variant.
    pub fn arb_request() -> impl Strategy<Value = Request> {
        prop_oneof![
            arb_commit_batch().prop_map(Request::Commit),
            arb_object_id().prop_map(|oid| Request::EvictObject { oid }),
            arb_object_id().prop_map(|oid| Request::DowngradeObject { oid }),
            arb_binding_key().prop_map(|key| Request::EvictBinding { key }),
            arb_binding_key().prop_map(|key| Request::DowngradeBinding { key }),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made requests for common scenarios.

    use super::*;

    /// Commit storing `value` under `object`.
    pub fn store(object: i64, value: &[u8]) -> Request {
        Request::Commit(CommitBatch::new().store(oid(object), value.to_vec()))
    }

    pub fn evict_object(object: i64) -> Request {
        Request::EvictObject { oid: oid(object) }
    }

    pub fn downgrade_object(object: i64) -> Request {
        Request::DowngradeObject { oid: oid(object) }
    }

    pub fn evict_binding(name: &str) -> Request {
        Request::EvictBinding {
            key: BindingKey::name(name),
        }
    }

    pub fn downgrade_binding(name: &str) -> Request {
        Request::DowngradeBinding {
            key: BindingKey::name(name),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on coherence results.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a result is a consistency fault.
    #[track_caller]
    pub fn assert_consistency_fault<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        match result {
            Err(CoherenceError::Consistency(_)) => {}
            other => panic!("Expected ConsistencyFault, got: {:?}", other),
        }
    }

    /// Assert that a result is an input-validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        match result {
            Err(CoherenceError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that a result is a channel failure.
    #[track_caller]
    pub fn assert_channel_failure<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        match result {
            Err(CoherenceError::Channel(_)) => {}
            other => panic!("Expected Channel error, got: {:?}", other),
        }
    }

    /// Assert the coherence invariant on a state: at most one writer and no
    /// other holder beside it, and no empty reader sets.
    #[track_caller]
    pub fn assert_coherent(key: &Key, state: &AccessState) {
        assert!(state.is_coherent(), "Incoherent state for {}: {:?}", key, state);
        if let Some(writer) = state.writer() {
            let holders = state.holders();
            assert_eq!(
                holders.len(),
                1,
                "Writer {} on {} shares the key with {:?}",
                writer,
                key,
                holders
            );
        }
    }
}
