//! Sequence numbers of a client's standalone history.
//!
//! Standalone transactions share one history and one counter across every
//! shard, so each shard sees only some of the sequence numbers. When a
//! transaction readies, every shard it touches is told which earlier
//! numbers will never reach it, keeping that shard's purged ranges
//! contiguous. A number still open (allocated, not yet readied or
//! cancelled) stops the walk; the next ready on that shard covers it.

use crate::types::ShardName;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

#[derive(Debug, Default)]
struct SequencerState {
    next_seq: u64,
    open: BTreeSet<u64>,
    /// Per shard, the first sequence number not yet accounted for.
    covered: BTreeMap<ShardName, u64>,
    /// Per shard, readied numbers past `covered`.
    ahead: BTreeMap<ShardName, BTreeSet<u64>>,
}

/// Allocates standalone sequence numbers and computes skipped ranges.
#[derive(Debug, Default)]
pub(crate) struct StandaloneSequencer {
    state: Mutex<SequencerState>,
}

impl StandaloneSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next sequence number.
    pub fn open(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.open.insert(seq);
        seq
    }

    /// Forgets an open transaction that will never ready.
    pub fn cancelled(&self, seq: u64) {
        self.state.lock().open.remove(&seq);
    }

    /// Marks `seq` readied on `shards` and returns, per shard, the ranges
    /// of earlier numbers that shard will never see.
    pub fn readied<'a>(
        &self,
        seq: u64,
        shards: impl IntoIterator<Item = &'a ShardName>,
    ) -> BTreeMap<ShardName, Vec<Range<u64>>> {
        let mut state = self.state.lock();
        state.open.remove(&seq);
        shards
            .into_iter()
            .map(|shard| {
                state.ahead.entry(shard.clone()).or_default().insert(seq);
                (shard.clone(), state.advance(shard))
            })
            .collect()
    }
}

impl SequencerState {
    fn advance(&mut self, shard: &ShardName) -> Vec<Range<u64>> {
        let mut cursor = self.covered.get(shard).copied().unwrap_or(0);
        let mut skipped: Vec<Range<u64>> = Vec::new();
        let ahead = self.ahead.entry(shard.clone()).or_default();
        while cursor < self.next_seq && !self.open.contains(&cursor) {
            if !ahead.remove(&cursor) {
                match skipped.last_mut() {
                    Some(last) if last.end == cursor => last.end = cursor + 1,
                    _ => skipped.push(cursor..cursor + 1),
                }
            }
            cursor += 1;
        }
        self.covered.insert(shard.clone(), cursor);
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(name: &str) -> ShardName {
        ShardName::new(name)
    }

    #[test]
    fn alternating_shards_skip_each_others_numbers() {
        let sequencer = StandaloneSequencer::new();
        let (a, b) = (shard("a"), shard("b"));

        let mut skipped_on_a = Vec::new();
        for round in 0..100 {
            let seq = sequencer.open();
            let target = if round % 2 == 0 { &a } else { &b };
            let mut ranges = sequencer.readied(seq, [target]);
            if let Some(found) = ranges.remove(&a) {
                skipped_on_a.extend(found);
            }
        }
        // Every odd number went to `b`; `a` learns about each one when its
        // next transaction readies.
        assert_eq!(skipped_on_a.len(), 49);
        assert!(skipped_on_a.iter().all(|r| r.end - r.start == 1 && r.start % 2 == 1));
    }

    #[test]
    fn open_numbers_stop_the_walk_until_resolved() {
        let sequencer = StandaloneSequencer::new();
        let a = shard("a");

        let reader = sequencer.open();
        let first = sequencer.open();
        assert_eq!(sequencer.readied(first, [&a])[&a], Vec::<Range<u64>>::new());

        sequencer.cancelled(reader);
        let second = sequencer.open();
        assert_eq!(sequencer.readied(second, [&a])[&a], vec![0..1]);
    }

    #[test]
    fn out_of_order_readies_are_not_skipped() {
        let sequencer = StandaloneSequencer::new();
        let (a, b) = (shard("a"), shard("b"));

        let first = sequencer.open();
        let second = sequencer.open();
        let third = sequencer.open();
        assert!(sequencer.readied(second, [&a])[&a].is_empty());
        assert!(sequencer.readied(third, [&b])[&b].is_empty());
        // `first` unblocks both shards: `a` skips only `third`.
        let ranges = sequencer.readied(first, [&a, &b]);
        assert_eq!(ranges[&a], vec![2..3]);
        assert_eq!(ranges[&b], vec![1..2]);
    }
}
