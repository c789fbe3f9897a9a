//! Per-partition commit queue.
//!
//! Readied transactions wait here in arrival order. Only the transaction at
//! the head may finish `can_commit`, so at most one entry is ever in
//! [`CohortState::CanCommitComplete`], and it is the head.
//!
//! # Crossed queues
//!
//! Two transactions that touch the same partitions can be readied in
//! different orders on different partitions. Coordinators issue
//! `can_commit` to partitions in participating-shard order, so a
//! transaction asking here has already passed every partition before this
//! one in its list (its prefix). If a `Ready` entry ahead of it has the
//! same prefix, that entry cannot have passed the prefix yet, so the asker
//! is moved in front of it. Transactions with no prefix, or with no
//! matching entry ahead, wait their turn.
//!
//! A transaction never moves ahead of an entry of its own chain.
//!
//! # Expiry
//!
//! A head left idle past the expiry timeout is removed. The queue
//! remembers the most recent expired transactions so a late `can_commit`
//! or `commit` fails with the original `Timeout` instead of
//! `UnknownTransaction`.

use crate::error::{DatastoreError, DatastoreResult};
use crate::tree::Modification;
use crate::types::{ParticipatingShards, ShardName, TransactionId};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Expired transactions remembered for late requests.
const EXPIRED_RECORD_CAPACITY: usize = 1024;

/// Three-phase-commit state of a queued transaction on one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CohortState {
    /// Readied, `can_commit` not yet requested.
    Ready,
    /// `can_commit` requested, waiting to reach the head.
    CanCommitPending,
    /// `can_commit` succeeded; waiting for `commit`.
    CanCommitComplete,
}

impl fmt::Display for CohortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::CanCommitPending => write!(f, "CAN_COMMIT_PENDING"),
            Self::CanCommitComplete => write!(f, "CAN_COMMIT_COMPLETE"),
        }
    }
}

/// Outcome of a `can_commit` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanCommitDecision {
    /// The transaction is at the head and may be validated now.
    Proceed,
    /// The transaction waits until it reaches the head.
    Held,
}

/// A readied transaction waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedTransaction {
    /// Transaction.
    pub txid: TransactionId,
    /// Frozen participating shards.
    pub shards: ParticipatingShards,
    /// Changes this transaction makes to the partition.
    pub modifications: Vec<Modification>,
    /// Current state.
    pub state: CohortState,
    /// Last time a request touched this entry.
    pub last_access: Instant,
}

impl QueuedTransaction {
    /// Creates a `Ready` entry.
    #[must_use]
    pub fn new(
        txid: TransactionId,
        shards: ParticipatingShards,
        modifications: Vec<Modification>,
        now: Instant,
    ) -> Self {
        Self {
            txid,
            shards,
            modifications,
            state: CohortState::Ready,
            last_access: now,
        }
    }
}

/// Ordered queue of readied transactions for one partition.
#[derive(Debug)]
pub struct CommitQueue {
    shard: ShardName,
    pending: VecDeque<QueuedTransaction>,
    expired: VecDeque<(TransactionId, DatastoreError)>,
}

impl CommitQueue {
    /// Creates an empty queue for `shard`.
    #[must_use]
    pub fn new(shard: ShardName) -> Self {
        Self {
            shard,
            pending: VecDeque::new(),
            expired: VecDeque::new(),
        }
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The transaction at the head.
    #[must_use]
    pub fn head(&self) -> Option<&QueuedTransaction> {
        self.pending.front()
    }

    /// Looks up a queued transaction.
    #[must_use]
    pub fn get(&self, txid: &TransactionId) -> Option<&QueuedTransaction> {
        self.pending.iter().find(|entry| &entry.txid == txid)
    }

    /// Returns true if `txid` is queued.
    #[must_use]
    pub fn contains(&self, txid: &TransactionId) -> bool {
        self.get(txid).is_some()
    }

    /// Queued transaction ids, head first.
    pub fn txids(&self) -> impl Iterator<Item = &TransactionId> {
        self.pending.iter().map(|entry| &entry.txid)
    }

    /// Appends a readied transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction is already queued.
    pub fn enqueue(&mut self, entry: QueuedTransaction) -> DatastoreResult<()> {
        if self.contains(&entry.txid) {
            return Err(DatastoreError::invalid_operation(format!(
                "transaction {} is already queued on shard {}",
                entry.txid, self.shard
            )));
        }
        self.pending.push_back(entry);
        Ok(())
    }

    /// Handles a `can_commit` request for `txid`.
    ///
    /// On [`CanCommitDecision::Proceed`] the caller validates the head and
    /// then calls [`can_commit_succeeded`](Self::can_commit_succeeded) or
    /// [`remove`](Self::remove).
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` if `txid` is not queued, the recorded
    /// `Timeout` if it expired and `InvalidOperation` if `can_commit` was
    /// already requested.
    pub fn can_commit(
        &mut self,
        txid: &TransactionId,
        now: Instant,
    ) -> DatastoreResult<CanCommitDecision> {
        let position = self.position(txid)?;
        let entry = &mut self.pending[position];
        if entry.state != CohortState::Ready {
            return Err(DatastoreError::invalid_operation(format!(
                "can_commit for {txid} on shard {} in state {}",
                self.shard, entry.state
            )));
        }
        entry.state = CohortState::CanCommitPending;
        entry.last_access = now;

        if position == 0 {
            return Ok(CanCommitDecision::Proceed);
        }

        let Some(target) = self.move_target(position) else {
            debug!(shard = %self.shard, %txid, position, "can_commit held behind earlier transactions");
            return Ok(CanCommitDecision::Held);
        };

        if let Some(entry) = self.pending.remove(position) {
            debug!(shard = %self.shard, %txid, from = position, to = target, "moving transaction ahead in commit queue");
            self.pending.insert(target, entry);
        }

        if target == 0 {
            Ok(CanCommitDecision::Proceed)
        } else {
            Ok(CanCommitDecision::Held)
        }
    }

    /// Index of the first `Ready` entry ahead of `position` sharing its
    /// prefix, ignoring anything at or before an entry of its own chain.
    fn move_target(&self, position: usize) -> Option<usize> {
        let entry = &self.pending[position];
        let prefix = entry.shards.prefix_before(&self.shard);
        if prefix.is_empty() {
            return None;
        }

        let history = &entry.txid.history;
        let mut target = None;
        for (index, ahead) in self.pending.iter().take(position).enumerate() {
            if history.is_chain() && &ahead.txid.history == history {
                target = None;
                continue;
            }
            if ahead.state != CohortState::Ready {
                continue;
            }
            if target.is_none() && ahead.shards.prefix_before(&self.shard) == prefix {
                target = Some(index);
            }
        }
        target
    }

    /// Marks the head as validated. The grant restarts its idle clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless `txid` is the head awaiting
    /// validation.
    pub fn can_commit_succeeded(&mut self, txid: &TransactionId, now: Instant) -> DatastoreResult<()> {
        match self.pending.front_mut() {
            Some(head) if &head.txid == txid && head.state == CohortState::CanCommitPending => {
                head.state = CohortState::CanCommitComplete;
                head.last_access = now;
                Ok(())
            }
            _ => Err(DatastoreError::invalid_operation(format!(
                "transaction {txid} is not awaiting can_commit at the head of shard {}",
                self.shard
            ))),
        }
    }

    /// Removes the head so it can be committed.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` if `txid` is not queued, the recorded
    /// `Timeout` if it expired and `InvalidOperation` unless it is the head
    /// in `CanCommitComplete`.
    pub fn take_for_commit(&mut self, txid: &TransactionId) -> DatastoreResult<QueuedTransaction> {
        let position = self.position(txid)?;
        let entry = &self.pending[position];
        if position != 0 || entry.state != CohortState::CanCommitComplete {
            return Err(DatastoreError::invalid_operation(format!(
                "commit for {txid} on shard {} in state {} at position {position}",
                self.shard, entry.state
            )));
        }
        self.pending
            .pop_front()
            .ok_or_else(|| DatastoreError::UnknownTransaction {
                shard: self.shard.clone(),
                txid: txid.clone(),
            })
    }

    /// Removes `txid` wherever it is queued.
    pub fn remove(&mut self, txid: &TransactionId) -> Option<QueuedTransaction> {
        let position = self.pending.iter().position(|entry| &entry.txid == txid)?;
        self.pending.remove(position)
    }

    /// Returns the head's id if it is waiting in `CanCommitPending`, i.e.
    /// its `can_commit` was held and can now proceed.
    #[must_use]
    pub fn promotable_head(&self) -> Option<TransactionId> {
        self.pending
            .front()
            .filter(|head| head.state == CohortState::CanCommitPending)
            .map(|head| head.txid.clone())
    }

    /// Returns the head if it has been idle for at least `timeout`.
    #[must_use]
    pub fn expired_head(&self, now: Instant, timeout: Duration) -> Option<(&QueuedTransaction, Duration)> {
        let head = self.pending.front()?;
        let idle = now.saturating_duration_since(head.last_access);
        (idle >= timeout).then_some((head, idle))
    }

    /// Removes an idle `txid` and records `error` as the answer to any
    /// later request for it.
    pub fn expire(&mut self, txid: &TransactionId, error: DatastoreError) -> Option<QueuedTransaction> {
        let entry = self.remove(txid)?;
        if self.expired.len() == EXPIRED_RECORD_CAPACITY {
            self.expired.pop_front();
        }
        self.expired.push_back((txid.clone(), error));
        Some(entry)
    }

    /// Drops the expiry record of `txid`. Returns false if there was none.
    pub fn forget_expired(&mut self, txid: &TransactionId) -> bool {
        match self.expired.iter().position(|(expired, _)| expired == txid) {
            Some(position) => self.expired.remove(position).is_some(),
            None => false,
        }
    }

    /// Refreshes the idle clock of `txid`.
    pub fn touch(&mut self, txid: &TransactionId, now: Instant) {
        if let Some(entry) = self.pending.iter_mut().find(|entry| &entry.txid == txid) {
            entry.last_access = now;
        }
    }

    /// Removes every entry, head first.
    pub fn drain(&mut self) -> impl Iterator<Item = QueuedTransaction> + '_ {
        self.pending.drain(..)
    }

    fn position(&self, txid: &TransactionId) -> DatastoreResult<usize> {
        if let Some(position) = self.pending.iter().position(|entry| &entry.txid == txid) {
            return Ok(position);
        }
        match self.expired.iter().find(|(expired, _)| expired == txid) {
            Some((_, error)) => Err(error.clone()),
            None => Err(DatastoreError::UnknownTransaction {
                shard: self.shard.clone(),
                txid: txid.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, HistoryId, MemberName};
    use proptest::prelude::*;

    fn shard(name: &str) -> ShardName {
        ShardName::new(name)
    }

    fn shards(names: &[&str]) -> ParticipatingShards {
        ParticipatingShards::new(names.iter().map(|n| shard(n)))
    }

    fn client() -> ClientId {
        ClientId::new(MemberName::new("member-1"), 0)
    }

    fn tx(seq: u64) -> TransactionId {
        TransactionId::new(HistoryId::standalone(client()), seq)
    }

    fn chain_tx(history: u64, seq: u64) -> TransactionId {
        TransactionId::new(HistoryId::new(client(), history), seq)
    }

    fn queue_with(local: &str, entries: &[(TransactionId, &[&str])]) -> CommitQueue {
        let now = Instant::now();
        let mut queue = CommitQueue::new(shard(local));
        for (txid, names) in entries {
            queue
                .enqueue(QueuedTransaction::new(txid.clone(), shards(names), Vec::new(), now))
                .unwrap();
        }
        queue
    }

    fn order(queue: &CommitQueue) -> Vec<TransactionId> {
        queue.txids().cloned().collect()
    }

    #[test]
    fn head_proceeds() {
        let mut queue = queue_with("a", &[(tx(1), &["a"])]);
        let decision = queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Proceed);
        queue.can_commit_succeeded(&tx(1), Instant::now()).unwrap();
        assert_eq!(queue.head().unwrap().state, CohortState::CanCommitComplete);
    }

    #[test]
    fn unknown_transaction_is_reported() {
        let mut queue = CommitQueue::new(shard("a"));
        let err = queue.can_commit(&tx(9), Instant::now()).unwrap_err();
        assert!(matches!(err, DatastoreError::UnknownTransaction { .. }));
    }

    #[test]
    fn duplicate_enqueue_rejected() {
        let mut queue = queue_with("a", &[(tx(1), &["a"])]);
        let dup = QueuedTransaction::new(tx(1), shards(&["a"]), Vec::new(), Instant::now());
        assert!(queue.enqueue(dup).is_err());
    }

    #[test]
    fn no_prefix_waits_for_head() {
        let mut queue = queue_with("a", &[(tx(1), &["a", "b"]), (tx(2), &["a", "b"])]);
        let decision = queue.can_commit(&tx(2), Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Held);
        assert_eq!(order(&queue), vec![tx(1), tx(2)]);
        assert!(queue.promotable_head().is_none());
    }

    #[test]
    fn matching_prefix_moves_ahead_of_ready_entry() {
        // On "b", tx 2 was readied first, but tx 1 already passed "a".
        let mut queue = queue_with("b", &[(tx(2), &["a", "b"]), (tx(1), &["a", "b"])]);
        let decision = queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Proceed);
        assert_eq!(order(&queue), vec![tx(1), tx(2)]);
    }

    #[test]
    fn different_prefix_does_not_move() {
        let mut queue = queue_with("c", &[(tx(2), &["b", "c"]), (tx(1), &["a", "c"])]);
        let decision = queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Held);
        assert_eq!(order(&queue), vec![tx(2), tx(1)]);
    }

    #[test]
    fn never_moves_ahead_of_pending_entries() {
        let mut queue = queue_with(
            "b",
            &[(tx(3), &["b"]), (tx(2), &["a", "b"]), (tx(1), &["a", "b"])],
        );
        queue.can_commit(&tx(3), Instant::now()).unwrap();

        let decision = queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Held);
        assert_eq!(order(&queue), vec![tx(3), tx(1), tx(2)]);
    }

    #[test]
    fn never_moves_ahead_of_own_chain() {
        let first = chain_tx(1, 1);
        let second = chain_tx(1, 2);
        let mut queue = queue_with("b", &[(first.clone(), &["a", "b"]), (second.clone(), &["a", "b"])]);

        let decision = queue.can_commit(&second, Instant::now()).unwrap();
        assert_eq!(decision, CanCommitDecision::Held);
        assert_eq!(order(&queue), vec![first, second]);
    }

    #[test]
    fn held_head_is_promoted_after_removal() {
        let mut queue = queue_with("a", &[(tx(1), &["a"]), (tx(2), &["a"])]);
        let now = Instant::now();
        queue.can_commit(&tx(1), now).unwrap();
        queue.can_commit_succeeded(&tx(1), now).unwrap();
        assert_eq!(queue.can_commit(&tx(2), now).unwrap(), CanCommitDecision::Held);

        let committed = queue.take_for_commit(&tx(1)).unwrap();
        assert_eq!(committed.txid, tx(1));
        assert_eq!(queue.promotable_head(), Some(tx(2)));
    }

    #[test]
    fn commit_requires_completed_head() {
        let mut queue = queue_with("a", &[(tx(1), &["a"])]);
        assert!(queue.take_for_commit(&tx(1)).is_err());
        queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert!(queue.take_for_commit(&tx(1)).is_err());
    }

    #[test]
    fn second_can_commit_is_rejected() {
        let mut queue = queue_with("a", &[(tx(1), &["a"])]);
        queue.can_commit(&tx(1), Instant::now()).unwrap();
        assert!(matches!(
            queue.can_commit(&tx(1), Instant::now()),
            Err(DatastoreError::InvalidOperation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_head_expires() {
        let queue = queue_with("a", &[(tx(1), &["a"])]);
        let timeout = Duration::from_secs(10);
        assert!(queue.expired_head(Instant::now(), timeout).is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let (head, idle) = queue.expired_head(Instant::now(), timeout).unwrap();
        assert_eq!(head.txid, tx(1));
        assert!(idle >= timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn can_commit_grant_restarts_the_idle_clock() {
        let mut queue = queue_with("a", &[(tx(1), &["a"]), (tx(2), &["a"])]);
        let timeout = Duration::from_secs(1);
        queue.can_commit(&tx(1), Instant::now()).unwrap();
        queue.can_commit_succeeded(&tx(1), Instant::now()).unwrap();
        assert_eq!(queue.can_commit(&tx(2), Instant::now()).unwrap(), CanCommitDecision::Held);

        // tx2 is granted late in its idle window, once tx1 commits.
        tokio::time::advance(Duration::from_millis(850)).await;
        queue.take_for_commit(&tx(1)).unwrap();
        assert_eq!(queue.promotable_head(), Some(tx(2)));
        queue.can_commit_succeeded(&tx(2), Instant::now()).unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(queue.expired_head(Instant::now(), timeout).is_none());
        assert_eq!(queue.take_for_commit(&tx(2)).unwrap().txid, tx(2));
    }

    #[test]
    fn expired_transaction_answers_with_its_timeout() {
        let mut queue = queue_with("a", &[(tx(1), &["a"]), (tx(2), &["a"])]);
        let error = DatastoreError::timeout("backend timeout in state READY after 1000ms");
        assert!(queue.expire(&tx(1), error).is_some());
        assert_eq!(order(&queue), vec![tx(2)]);

        assert!(matches!(
            queue.can_commit(&tx(1), Instant::now()),
            Err(DatastoreError::Timeout { .. })
        ));
        assert!(matches!(
            queue.take_for_commit(&tx(1)),
            Err(DatastoreError::Timeout { .. })
        ));

        assert!(queue.forget_expired(&tx(1)));
        assert!(!queue.forget_expired(&tx(1)));
        assert!(matches!(
            queue.can_commit(&tx(1), Instant::now()),
            Err(DatastoreError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn expiry_record_is_bounded() {
        let mut queue = CommitQueue::new(shard("a"));
        for seq in 0..=EXPIRED_RECORD_CAPACITY as u64 {
            queue
                .enqueue(QueuedTransaction::new(tx(seq), shards(&["a"]), Vec::new(), Instant::now()))
                .unwrap();
            queue.expire(&tx(seq), DatastoreError::timeout("idle")).unwrap();
        }
        assert!(!queue.forget_expired(&tx(0)));
        assert!(queue.forget_expired(&tx(EXPIRED_RECORD_CAPACITY as u64)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Ready(Vec<bool>),
        CanCommit(usize),
        CommitHead,
        Abort(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<bool>(), 3).prop_map(Op::Ready),
            (0usize..8).prop_map(Op::CanCommit),
            Just(Op::CommitHead),
            (0usize..8).prop_map(Op::Abort),
        ]
    }

    proptest! {
        #[test]
        fn only_the_head_completes_can_commit(ops in proptest::collection::vec(op(), 1..60)) {
            let names = ["a", "b", "c"];
            let mut queue = CommitQueue::new(shard("b"));
            let now = Instant::now();
            let mut next_seq = 0u64;

            let validate = |queue: &mut CommitQueue, txid: TransactionId| {
                queue.can_commit_succeeded(&txid, now).unwrap();
            };

            for op in ops {
                match op {
                    Op::Ready(mask) => {
                        let mut set: Vec<&str> = names
                            .iter()
                            .zip(mask)
                            .filter_map(|(n, keep)| keep.then_some(*n))
                            .collect();
                        if !set.contains(&"b") {
                            set.push("b");
                        }
                        next_seq += 1;
                        queue
                            .enqueue(QueuedTransaction::new(tx(next_seq), shards(&set), Vec::new(), now))
                            .unwrap();
                    }
                    Op::CanCommit(pick) => {
                        let ready: Vec<TransactionId> = queue
                            .pending
                            .iter()
                            .filter(|e| e.state == CohortState::Ready)
                            .map(|e| e.txid.clone())
                            .collect();
                        if let Some(txid) = ready.get(pick % ready.len().max(1)).cloned() {
                            if queue.can_commit(&txid, now).unwrap() == CanCommitDecision::Proceed {
                                validate(&mut queue, txid);
                            }
                        }
                    }
                    Op::CommitHead => {
                        let head = queue.head().filter(|h| h.state == CohortState::CanCommitComplete).map(|h| h.txid.clone());
                        if let Some(txid) = head {
                            queue.take_for_commit(&txid).unwrap();
                            if let Some(next) = queue.promotable_head() {
                                validate(&mut queue, next);
                            }
                        }
                    }
                    Op::Abort(pick) => {
                        let all: Vec<TransactionId> = queue.txids().cloned().collect();
                        if let Some(txid) = all.get(pick % all.len().max(1)).cloned() {
                            queue.remove(&txid);
                            if let Some(next) = queue.promotable_head() {
                                validate(&mut queue, next);
                            }
                        }
                    }
                }

                let completed: Vec<usize> = queue
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.state == CohortState::CanCommitComplete)
                    .map(|(i, _)| i)
                    .collect();
                prop_assert!(completed.is_empty() || completed == vec![0]);
            }
        }
    }
}
