//! Property-based test generators using proptest.
//!
//! Paths are drawn from a small alphabet so generated modifications
//! overlap often, which is where tree application gets interesting.

use proptest::prelude::*;
use tessera_core::{Modification, Node, ParticipatingShards, Path, ShardName};

/// Strategy for a single path segment.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_owned)
}

/// Strategy for non-root paths of depth 1 to 3.
pub fn path_strategy() -> impl Strategy<Value = Path> {
    prop::collection::vec(segment_strategy(), 1..=3).prop_map(Path::new)
}

/// Strategy for leaf nodes with short values.
pub fn leaf_strategy() -> impl Strategy<Value = Node> {
    prop::collection::vec(any::<u8>(), 0..8).prop_map(Node::leaf)
}

/// Strategy for nodes up to two levels deep.
pub fn node_strategy() -> impl Strategy<Value = Node> {
    leaf_strategy().prop_recursive(2, 8, 3, |inner| {
        prop::collection::btree_map(segment_strategy(), inner, 0..3).prop_map(|children| {
            children
                .into_iter()
                .fold(Node::container(), |node, (name, child)| node.with_child(name, child))
        })
    })
}

/// Strategy for a single write, merge or delete below the root.
pub fn modification_strategy() -> impl Strategy<Value = Modification> {
    prop_oneof![
        (path_strategy(), node_strategy()).prop_map(|(path, data)| Modification::Write { path, data }),
        (path_strategy(), node_strategy()).prop_map(|(path, data)| Modification::Merge { path, data }),
        path_strategy().prop_map(|path| Modification::Delete { path }),
    ]
}

/// Strategy for short modification lists.
pub fn modifications_strategy() -> impl Strategy<Value = Vec<Modification>> {
    prop::collection::vec(modification_strategy(), 0..8)
}

/// Strategy for participating shard lists over `shard-0` to `shard-{n-1}`.
pub fn shard_list_strategy(n: usize) -> impl Strategy<Value = ParticipatingShards> {
    let names: Vec<ShardName> = (0..n).map(|i| ShardName::new(format!("shard-{i}"))).collect();
    prop::sample::subsequence(names, 1..=n).prop_map(ParticipatingShards::new)
}
