//! Replicated log entries and the in-memory log view.

use crate::tree::Modification;
use crate::types::{HistoryId, LogIndex, Term, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// State-machine command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Apply a transaction's modifications.
    CommitTransaction {
        /// Transaction.
        txid: TransactionId,
        /// Ordered changes.
        modifications: Vec<Modification>,
    },
    /// Record that a readied transaction was aborted.
    AbortTransaction {
        /// Transaction.
        txid: TransactionId,
    },
    /// Forget a committed or aborted transaction.
    PurgeTransaction {
        /// Transaction.
        txid: TransactionId,
    },
    /// Chain transactions `from..to` never touched this partition.
    SkipTransactions {
        /// Chain history.
        history: HistoryId,
        /// First skipped sequence.
        from: u64,
        /// One past the last skipped sequence.
        to: u64,
    },
    /// The client closed the chain.
    CloseHistory {
        /// Chain history.
        history: HistoryId,
    },
    /// Drop all bookkeeping for a closed, fully purged chain.
    PurgeHistory {
        /// Chain history.
        history: HistoryId,
    },
    /// First entry of a new leader's term.
    LeaderNoop,
}

impl Payload {
    /// Returns true if applying this payload forces a snapshot.
    #[must_use]
    pub fn is_root_overwrite(&self) -> bool {
        match self {
            Self::CommitTransaction { modifications, .. } => {
                modifications.iter().any(Modification::is_root_overwrite)
            }
            _ => false,
        }
    }
}

/// One entry of a partition's replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log.
    pub index: LogIndex,
    /// Term of the leader that appended it.
    pub term: Term,
    /// Command.
    pub payload: Payload,
}

/// Entries retained since the last snapshot, plus commit/apply progress.
///
/// Entries are contiguous: the first retained entry follows
/// `snapshot_index`.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: VecDeque<(LogEntry, u64)>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    commit_index: LogIndex,
    last_applied: LogIndex,
    data_size: u64,
}

impl ReplicatedLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that starts right after a snapshot.
    #[must_use]
    pub fn from_snapshot(index: LogIndex, term: Term) -> Self {
        Self {
            snapshot_index: index,
            snapshot_term: term,
            commit_index: index,
            last_applied: index,
            ..Self::default()
        }
    }

    /// Index of the newest entry (or of the snapshot if none are retained).
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map_or(self.snapshot_index, |(entry, _)| entry.index)
    }

    /// Term of the newest entry.
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map_or(self.snapshot_term, |(entry, _)| entry.term)
    }

    /// Index covered by the latest snapshot.
    #[must_use]
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// Term of the latest snapshot.
    #[must_use]
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Highest index known to be held by a quorum.
    #[must_use]
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Highest index applied to the state machine.
    #[must_use]
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded bytes of the retained entries.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns the term of the entry at `index`, if known.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Returns the entry at `index` if it is retained.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let offset = index.as_u64().checked_sub(self.snapshot_index.as_u64() + 1)?;
        self.entries.get(offset as usize).map(|(entry, _)| entry)
    }

    /// Appends the next entry. `encoded_len` is its journal footprint.
    pub fn append(&mut self, entry: LogEntry, encoded_len: u64) {
        debug_assert_eq!(entry.index, self.last_index().next());
        self.data_size += encoded_len;
        self.entries.push_back((entry, encoded_len));
    }

    /// Clones up to `max` entries starting at `from`.
    ///
    /// Returns `None` if `from` has been folded into a snapshot.
    #[must_use]
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Option<Vec<LogEntry>> {
        if from <= self.snapshot_index {
            return None;
        }
        let offset = (from.as_u64() - self.snapshot_index.as_u64() - 1) as usize;
        Some(
            self.entries
                .iter()
                .skip(offset)
                .take(max)
                .map(|(entry, _)| entry.clone())
                .collect(),
        )
    }

    /// Removes entries at and after `from`. Committed entries are never
    /// removed; returns false if asked to.
    pub fn truncate_from(&mut self, from: LogIndex) -> bool {
        if from <= self.commit_index {
            return false;
        }
        while self
            .entries
            .back()
            .is_some_and(|(entry, _)| entry.index >= from)
        {
            if let Some((_, size)) = self.entries.pop_back() {
                self.data_size -= size;
            }
        }
        true
    }

    /// Advances the commit index, never past the last entry or backwards.
    pub fn set_commit_index(&mut self, index: LogIndex) {
        let bounded = index.min(self.last_index());
        if bounded > self.commit_index {
            self.commit_index = bounded;
        }
    }

    /// Returns the next committed entry that has not been applied.
    #[must_use]
    pub fn next_to_apply(&self) -> Option<&LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        self.get(self.last_applied.next())
    }

    /// Records that `index` has been applied.
    pub fn mark_applied(&mut self, index: LogIndex) {
        debug_assert_eq!(index, self.last_applied.next());
        self.last_applied = index;
    }

    /// Folds entries up to and including `index` into a snapshot.
    pub fn snapshot_taken(&mut self, index: LogIndex, term: Term) {
        while self
            .entries
            .front()
            .is_some_and(|(entry, _)| entry.index <= index)
        {
            if let Some((_, size)) = self.entries.pop_front() {
                self.data_size -= size;
            }
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replaces the whole log with an installed snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        *self = Self::from_snapshot(index, term);
    }
}
