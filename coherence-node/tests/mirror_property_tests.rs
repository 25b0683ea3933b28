//! Property-Based Tests for the Cache Mirror
//!
//! The mirror must agree with a plain map model after any sequence of
//! grants, downgrades and evictions.

use coherence_node::CacheMirror;
use coherence_test_utils::generators::arb_small_key;
use coherence_test_utils::{AccessLevel, Key};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum MirrorOp {
    Grant(Key, AccessLevel),
    Downgrade(Key),
    Evict(Key),
    Clear,
}

fn arb_mirror_op() -> impl Strategy<Value = MirrorOp> {
    let level = prop_oneof![Just(AccessLevel::Read), Just(AccessLevel::Write)];
    prop_oneof![
        4 => (arb_small_key(), level).prop_map(|(key, level)| MirrorOp::Grant(key, level)),
        3 => arb_small_key().prop_map(MirrorOp::Downgrade),
        3 => arb_small_key().prop_map(MirrorOp::Evict),
        1 => Just(MirrorOp::Clear),
    ]
}

proptest! {
    #[test]
    fn prop_mirror_matches_model(ops in prop::collection::vec(arb_mirror_op(), 0..50)) {
        let mirror = CacheMirror::new();
        let mut model: HashMap<Key, AccessLevel> = HashMap::new();

        for op in ops {
            match op {
                MirrorOp::Grant(key, level) => {
                    mirror.record_grant(key.clone(), level);
                    model.insert(key, level);
                }
                MirrorOp::Downgrade(key) => {
                    let expected = model.get(&key) == Some(&AccessLevel::Write);
                    prop_assert_eq!(mirror.downgrade(&key), expected);
                    if expected {
                        model.insert(key, AccessLevel::Read);
                    }
                }
                MirrorOp::Evict(key) => {
                    prop_assert_eq!(mirror.evict(&key), model.remove(&key));
                }
                MirrorOp::Clear => {
                    mirror.clear();
                    model.clear();
                }
            }

            prop_assert_eq!(mirror.len(), model.len());
            for (key, level) in &model {
                prop_assert_eq!(mirror.level(key), Some(*level));
                prop_assert_eq!(mirror.may_write(key), *level == AccessLevel::Write);
            }
        }
    }
}
