//! Identifiers shared across the datastore.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Name of a cluster member (a process hosting partition replicas).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberName(Arc<str>);

impl MemberName {
    /// Creates a member name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical name of a partition ("shard").
///
/// Shard names are totally ordered; a transaction's participating shard
/// list is kept in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardName(Arc<str>);

impl ShardName {
    /// Creates a shard name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one datastore client incarnation.
///
/// A member restarting its frontend bumps the generation so identifiers
/// from the previous incarnation can never collide with new ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId {
    /// Member the client runs on.
    pub member: MemberName,
    /// Incarnation number.
    pub generation: u64,
}

impl ClientId {
    /// Creates a client identifier.
    #[must_use]
    pub fn new(member: MemberName, generation: u64) -> Self {
        Self { member, generation }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-g{}", self.member, self.generation)
    }
}

/// Identifies an ordered sequence of transactions sharing visibility.
///
/// History `0` of every client holds its standalone transactions; each
/// transaction chain gets its own non-zero history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistoryId {
    /// Owning client.
    pub client: ClientId,
    /// Per-client history number.
    pub history: u64,
}

impl HistoryId {
    /// History number reserved for standalone transactions.
    pub const STANDALONE: u64 = 0;

    /// Creates a history identifier.
    #[must_use]
    pub fn new(client: ClientId, history: u64) -> Self {
        Self { client, history }
    }

    /// Returns the standalone history of `client`.
    #[must_use]
    pub fn standalone(client: ClientId) -> Self {
        Self::new(client, Self::STANDALONE)
    }

    /// Returns true if this history belongs to a transaction chain.
    #[must_use]
    pub fn is_chain(&self) -> bool {
        self.history != Self::STANDALONE
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-h{}", self.client, self.history)
    }
}

/// Globally unique transaction identifier.
///
/// Made of the originating history and a per-history monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// History the transaction belongs to.
    pub history: HistoryId,
    /// Position within the history.
    pub seq: u64,
}

impl TransactionId {
    /// Creates a transaction identifier.
    #[must_use]
    pub fn new(history: HistoryId, seq: u64) -> Self {
        Self { history, seq }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-t{}", self.history, self.seq)
    }
}

/// Position of an entry in a partition's replicated log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// Index before the first entry.
    pub const ZERO: Self = Self(0);

    /// Creates a log index.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following index.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idx:{}", self.0)
    }
}

/// Leadership term.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    /// Creates a term.
    #[must_use]
    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the raw term value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following term.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term:{}", self.0)
    }
}

/// Ordered list of the partitions a transaction touches.
///
/// Frozen at `ready()` in shard-name order, so every partition sees the
/// same list for a given transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipatingShards(Arc<[ShardName]>);

impl ParticipatingShards {
    /// Builds the list from any set of shard names, sorting and
    /// de-duplicating them.
    #[must_use]
    pub fn new(shards: impl IntoIterator<Item = ShardName>) -> Self {
        let mut shards: Vec<ShardName> = shards.into_iter().collect();
        shards.sort();
        shards.dedup();
        Self(shards.into())
    }

    /// Returns the shards in order.
    #[must_use]
    pub fn as_slice(&self) -> &[ShardName] {
        &self.0
    }

    /// Returns the shards that precede `shard` in the list.
    ///
    /// A shard that is not in the list has no prefix.
    #[must_use]
    pub fn prefix_before(&self, shard: &ShardName) -> &[ShardName] {
        match self.0.iter().position(|s| s == shard) {
            Some(pos) => &self.0[..pos],
            None => &[],
        }
    }

    /// Returns true if `shard` participates.
    #[must_use]
    pub fn contains(&self, shard: &ShardName) -> bool {
        self.0.contains(shard)
    }

    /// Number of participating shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for an empty transaction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipatingShards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, shard) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(shard.as_str())?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(names: &[&str]) -> ParticipatingShards {
        ParticipatingShards::new(names.iter().map(ShardName::new))
    }

    #[test]
    fn transaction_id_display() {
        let client = ClientId::new(MemberName::new("member-1"), 2);
        let txid = TransactionId::new(HistoryId::new(client, 3), 7);
        assert_eq!(txid.to_string(), "member-1-g2-h3-t7");
    }

    #[test]
    fn standalone_history_is_not_a_chain() {
        let client = ClientId::new(MemberName::new("m"), 0);
        assert!(!HistoryId::standalone(client.clone()).is_chain());
        assert!(HistoryId::new(client, 1).is_chain());
    }

    #[test]
    fn participating_shards_are_sorted_and_unique() {
        let list = shards(&["cars", "people", "cars", "default"]);
        assert_eq!(list.to_string(), "[cars,default,people]");
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn prefix_before_excludes_current_shard() {
        let list = shards(&["a", "b", "c"]);
        assert!(list.prefix_before(&ShardName::new("a")).is_empty());
        assert_eq!(
            list.prefix_before(&ShardName::new("c")),
            &[ShardName::new("a"), ShardName::new("b")]
        );
        assert!(list.prefix_before(&ShardName::new("z")).is_empty());
    }

    #[test]
    fn log_index_next() {
        assert_eq!(LogIndex::ZERO.next(), LogIndex::new(1));
        assert_eq!(LogIndex::new(41).next().as_u64(), 42);
    }
}
