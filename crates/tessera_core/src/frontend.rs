//! Per-history bookkeeping of closed and purged transactions.
//!
//! Each replica keeps, for every client history that touched it, the set
//! of transactions that finished (committed or aborted) but are not yet
//! purged, and the ranges of purged sequence numbers. Purging bounds memory:
//! a purged transaction is forgotten except for its place in a range.
//!
//! # Invariants
//!
//! - A sequence number is purged at most once and only after it was closed
//!   or skipped.
//! - A closed history may only be dropped once its purged ranges form
//!   one contiguous range starting at zero; anything else is a hole, and a
//!   hole is a leak.
//! - Violations are reported as [`DatastoreError::PurgeInvariantViolation`]
//!   and never repaired.

use crate::error::{DatastoreError, DatastoreResult};
use crate::replication::Payload;
use crate::types::{HistoryId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Sorted, coalesced set of purged sequence numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgedRanges {
    ranges: Vec<Range<u64>>,
}

impl PurgedRanges {
    /// Returns true if `seq` is purged.
    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&seq))
    }

    /// Returns true if any of `range` is purged.
    #[must_use]
    pub fn intersects(&self, range: &Range<u64>) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
    }

    /// Adds `range`, merging with neighbours. Returns false (and changes
    /// nothing) if part of it is already present.
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        if self.intersects(&range) {
            return false;
        }
        let at = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.insert(at, range);

        // Coalesce with the following and preceding ranges.
        if at + 1 < self.ranges.len() && self.ranges[at].end == self.ranges[at + 1].start {
            let next = self.ranges.remove(at + 1);
            self.ranges[at].end = next.end;
        }
        if at > 0 && self.ranges[at - 1].end == self.ranges[at].start {
            let current = self.ranges.remove(at);
            self.ranges[at - 1].end = current.end;
        }
        true
    }

    /// Purged ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    /// Returns true if nothing is purged or everything purged forms one
    /// range starting at zero.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        match self.ranges.as_slice() {
            [] => true,
            [only] => only.start == 0,
            _ => false,
        }
    }
}

/// Closed and purged transactions of one history on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendHistoryMetadata {
    history: HistoryId,
    closed: bool,
    /// Finished, not yet purged: sequence to committed flag.
    finished: BTreeMap<u64, bool>,
    purged: PurgedRanges,
}

impl FrontendHistoryMetadata {
    /// Creates empty metadata for `history`.
    #[must_use]
    pub fn new(history: HistoryId) -> Self {
        Self {
            history,
            closed: false,
            finished: BTreeMap::new(),
            purged: PurgedRanges::default(),
        }
    }

    /// History this metadata describes.
    #[must_use]
    pub fn history(&self) -> &HistoryId {
        &self.history
    }

    /// Returns true once the client closed the history.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Purged sequence ranges.
    #[must_use]
    pub fn purged(&self) -> &PurgedRanges {
        &self.purged
    }

    /// Returns whether `seq` finished and, if so, whether it committed.
    #[must_use]
    pub fn finished(&self, seq: u64) -> Option<bool> {
        self.finished.get(&seq).copied()
    }

    /// Number of finished, unpurged transactions.
    #[must_use]
    pub fn unpurged_count(&self) -> usize {
        self.finished.len()
    }

    /// Records that transaction `seq` committed or aborted.
    ///
    /// # Errors
    ///
    /// Fails if `seq` is already purged or finished with the other outcome.
    pub fn on_transaction_finished(&mut self, seq: u64, committed: bool) -> DatastoreResult<()> {
        if self.purged.contains(seq) {
            return Err(self.violation(format!("transaction {seq} finished after it was purged")));
        }
        match self.finished.insert(seq, committed) {
            Some(previous) if previous != committed => Err(self.violation(format!(
                "transaction {seq} finished twice with different outcomes"
            ))),
            _ => Ok(()),
        }
    }

    /// Records that transaction `seq` was purged.
    ///
    /// # Errors
    ///
    /// Fails on a repeated purge or a purge of an unfinished transaction.
    pub fn on_transaction_purged(&mut self, seq: u64) -> DatastoreResult<()> {
        if self.purged.contains(seq) {
            return Err(self.violation(format!("transaction {seq} purged twice")));
        }
        if self.finished.remove(&seq).is_none() {
            return Err(self.violation(format!(
                "transaction {seq} purged before it finished"
            )));
        }
        self.purged.insert(seq..seq + 1);
        Ok(())
    }

    /// Records that transactions `from..to` never touched this partition.
    ///
    /// # Errors
    ///
    /// Fails if any of them finished or was purged here.
    pub fn on_transactions_skipped(&mut self, from: u64, to: u64) -> DatastoreResult<()> {
        if from >= to {
            return Ok(());
        }
        if self.finished.range(from..to).next().is_some() || !self.purged.insert(from..to) {
            return Err(self.violation(format!(
                "skipped range {from}..{to} overlaps known transactions"
            )));
        }
        Ok(())
    }

    /// Records that the client closed the history.
    pub fn on_closed(&mut self) {
        self.closed = true;
    }

    /// Returns true if the history can be dropped.
    #[must_use]
    pub fn is_purgeable(&self) -> bool {
        self.check_purgeable().is_ok()
    }

    /// Checks that dropping the history would not leak a transaction.
    ///
    /// # Errors
    ///
    /// Fails if the history is open, has finished transactions that were
    /// never purged, or has a hole in its purged ranges.
    pub fn check_purgeable(&self) -> DatastoreResult<()> {
        if !self.closed {
            return Err(self.violation("history purged while still open"));
        }
        if !self.finished.is_empty() {
            return Err(self.violation(format!(
                "{} finished transactions were never purged",
                self.finished.len()
            )));
        }
        if !self.purged.is_contiguous() {
            return Err(self.violation(format!(
                "hole in purged ranges {:?}",
                self.purged.ranges()
            )));
        }
        Ok(())
    }

    fn violation(&self, message: impl Into<String>) -> DatastoreError {
        DatastoreError::purge_violation(self.history.clone(), message)
    }
}

/// Snapshot form of [`FrontendMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendMetadataSnapshot {
    /// Live histories.
    pub histories: Vec<FrontendHistoryMetadata>,
    /// Histories already dropped.
    pub purged_histories: Vec<HistoryId>,
}

/// Frontend bookkeeping of one replica, across all clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendMetadata {
    histories: BTreeMap<HistoryId, FrontendHistoryMetadata>,
    purged_histories: BTreeSet<HistoryId>,
}

impl FrontendMetadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores metadata from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: FrontendMetadataSnapshot) -> Self {
        Self {
            histories: snapshot
                .histories
                .into_iter()
                .map(|meta| (meta.history.clone(), meta))
                .collect(),
            purged_histories: snapshot.purged_histories.into_iter().collect(),
        }
    }

    /// Captures the snapshot form.
    #[must_use]
    pub fn snapshot(&self) -> FrontendMetadataSnapshot {
        FrontendMetadataSnapshot {
            histories: self.histories.values().cloned().collect(),
            purged_histories: self.purged_histories.iter().cloned().collect(),
        }
    }

    /// Metadata of `history`, if it is live.
    #[must_use]
    pub fn history(&self, history: &HistoryId) -> Option<&FrontendHistoryMetadata> {
        self.histories.get(history)
    }

    /// Histories with metadata, in order.
    pub fn live_histories(&self) -> impl Iterator<Item = &HistoryId> {
        self.histories.keys()
    }

    /// Dropped histories, in order.
    pub fn purged_histories(&self) -> impl Iterator<Item = &HistoryId> {
        self.purged_histories.iter()
    }

    /// Returns true once `history` has been dropped.
    #[must_use]
    pub fn is_history_purged(&self, history: &HistoryId) -> bool {
        self.purged_histories.contains(history)
    }

    /// Closed chain histories whose every transaction has been purged.
    #[must_use]
    pub fn purgeable_histories(&self) -> Vec<HistoryId> {
        self.histories
            .values()
            .filter(|meta| meta.history.is_chain() && meta.is_purgeable())
            .map(|meta| meta.history.clone())
            .collect()
    }

    /// Finished transactions that were never purged, in history order.
    #[must_use]
    pub fn unpurged_transactions(&self) -> Vec<TransactionId> {
        self.histories
            .values()
            .flat_map(|meta| {
                meta.finished
                    .keys()
                    .map(|seq| TransactionId::new(meta.history.clone(), *seq))
            })
            .collect()
    }

    /// Applies the frontend effect of a replicated payload.
    ///
    /// # Errors
    ///
    /// Returns `PurgeInvariantViolation` if the payload would regress or
    /// leak; recorded transactions are left as they were.
    pub fn apply(&mut self, payload: &Payload) -> DatastoreResult<()> {
        match payload {
            Payload::CommitTransaction { txid, .. } => {
                self.live(&txid.history)?
                    .on_transaction_finished(txid.seq, true)
            }
            Payload::AbortTransaction { txid } => {
                self.live(&txid.history)?
                    .on_transaction_finished(txid.seq, false)
            }
            Payload::PurgeTransaction { txid } => self.purge_transaction(txid),
            Payload::SkipTransactions { history, from, to } => {
                self.live(history)?.on_transactions_skipped(*from, *to)
            }
            Payload::CloseHistory { history } => {
                self.live(history)?.on_closed();
                Ok(())
            }
            Payload::PurgeHistory { history } => {
                if let Some(meta) = self.histories.get(history) {
                    meta.check_purgeable()?;
                }
                self.histories.remove(history);
                self.purged_histories.insert(history.clone());
                Ok(())
            }
            Payload::LeaderNoop => Ok(()),
        }
    }

    fn purge_transaction(&mut self, txid: &TransactionId) -> DatastoreResult<()> {
        self.live(&txid.history)?.on_transaction_purged(txid.seq)
    }

    fn live(&mut self, history: &HistoryId) -> DatastoreResult<&mut FrontendHistoryMetadata> {
        if self.purged_histories.contains(history) {
            return Err(DatastoreError::purge_violation(
                history.clone(),
                "history used after it was purged",
            ));
        }
        Ok(self
            .histories
            .entry(history.clone())
            .or_insert_with(|| FrontendHistoryMetadata::new(history.clone())))
    }
}
