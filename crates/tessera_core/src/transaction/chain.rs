//! Ordered transaction chains.

use super::handle::TransactionHandle;
use super::state::{TransactionKind, TransactionShared};
use super::TransactionContext;
use crate::cohort::{CommitCohort, ReadyOutcome, ReadyRequest};
use crate::error::{DatastoreError, DatastoreResult};
use crate::tree::Modification;
use crate::types::{HistoryId, ParticipatingShards, ShardName, TransactionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct ReadiedTransaction {
    seq: u64,
    cohorts: Vec<CommitCohort>,
}

#[derive(Default)]
struct ChainState {
    next_seq: u64,
    open: Option<u64>,
    closed: bool,
    failure: Option<String>,
    /// Readied transactions that have not finished, oldest first.
    readied: Vec<ReadiedTransaction>,
    /// Next sequence number each shard expects from this chain.
    next_on_shard: BTreeMap<ShardName, u64>,
}

impl ChainState {
    fn cohorts_on(&self, shard: &ShardName) -> Vec<CommitCohort> {
        self.readied
            .iter()
            .flat_map(|t| t.cohorts.iter())
            .filter(|c| c.shard() == shard)
            .cloned()
            .collect()
    }
}

/// Chain internals shared with the chain's transactions.
pub(crate) struct ChainInner {
    history: HistoryId,
    context: Arc<TransactionContext>,
    state: Mutex<ChainState>,
    close_done: watch::Sender<bool>,
}

impl ChainInner {
    fn failed_error(&self, reason: &str) -> DatastoreError {
        DatastoreError::chain_state(self.history.clone(), format!("chain failed: {reason}"))
    }

    fn open_transaction(
        self: &Arc<Self>,
        kind: TransactionKind,
    ) -> DatastoreResult<TransactionHandle> {
        let seq = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DatastoreError::chain_state(
                    self.history.clone(),
                    "chain is closed",
                ));
            }
            if let Some(reason) = &state.failure {
                return Err(self.failed_error(reason));
            }
            if let Some(open) = state.open {
                return Err(DatastoreError::chain_state(
                    self.history.clone(),
                    format!("transaction {open} is still open"),
                ));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.open = Some(seq);
            seq
        };

        let txid = TransactionId::new(self.history.clone(), seq);
        debug!(%txid, %kind, "chain transaction opened");
        let shared = Arc::new(TransactionShared::new(txid, Some(Arc::clone(self))));
        Ok(TransactionHandle::new(shared, kind, Arc::clone(&self.context)))
    }

    /// Waits until every readied predecessor touching `shard` has been
    /// acknowledged by the shard's leader.
    pub async fn await_predecessors(&self, shard: &ShardName) -> DatastoreResult<()> {
        let predecessors = {
            let state = self.state.lock();
            if let Some(reason) = &state.failure {
                return Err(self.failed_error(reason));
            }
            state.cohorts_on(shard)
        };
        for cohort in predecessors {
            if let ReadyOutcome::Failed(e) = cohort.settled().await {
                let reason = format!("transaction {} failed to become ready: {e}", cohort.txid());
                self.fail(reason.clone());
                return Err(self.failed_error(&reason));
            }
        }
        Ok(())
    }

    /// Modifications of readied, unfinished predecessors on `shard`, oldest
    /// first.
    pub fn pending_modifications(&self, shard: &ShardName) -> Vec<Modification> {
        self.state
            .lock()
            .cohorts_on(shard)
            .iter()
            .flat_map(|c| c.modifications().iter().cloned())
            .collect()
    }

    /// Readies transaction `txid` of this chain, one cohort per shard.
    ///
    /// Each cohort carries the sequence numbers the shard will never see
    /// from this chain so the shard's history stays gap-free, and waits for
    /// the same shard's earlier cohorts before sending its own `ready`.
    pub fn ready(
        &self,
        txid: &TransactionId,
        staged: BTreeMap<ShardName, Vec<Modification>>,
    ) -> DatastoreResult<Vec<CommitCohort>> {
        let mut state = self.state.lock();
        if state.open == Some(txid.seq) {
            state.open = None;
        }
        if let Some(reason) = &state.failure {
            return Err(self.failed_error(reason));
        }

        let shards = ParticipatingShards::new(staged.keys().cloned());
        let timeout = self.context.config.transaction_commit_timeout;
        let mut cohorts = Vec::with_capacity(staged.len());
        for (shard, modifications) in staged {
            let expected = state.next_on_shard.get(&shard).copied().unwrap_or(0);
            let skipped: Vec<_> = (expected < txid.seq)
                .then_some(expected..txid.seq)
                .into_iter()
                .collect();
            state.next_on_shard.insert(shard.clone(), txid.seq + 1);

            let request = ReadyRequest {
                txid: txid.clone(),
                predecessors: state.cohorts_on(&shard),
                shard,
                shards: shards.clone(),
                modifications,
                skipped,
            };
            cohorts.push(CommitCohort::spawn(
                request,
                Arc::clone(&self.context.directory),
                timeout,
            ));
        }

        state.readied.push(ReadiedTransaction {
            seq: txid.seq,
            cohorts: cohorts.clone(),
        });
        Ok(cohorts)
    }

    pub fn transaction_cancelled(&self, txid: &TransactionId) {
        let mut state = self.state.lock();
        if state.open == Some(txid.seq) {
            state.open = None;
        }
    }

    pub fn transaction_finished(&self, txid: &TransactionId, committed: bool) {
        {
            let mut state = self.state.lock();
            if state.open == Some(txid.seq) {
                state.open = None;
            }
            state.readied.retain(|t| t.seq != txid.seq);
        }
        if !committed {
            self.fail(format!("transaction {txid} did not commit"));
        }
    }

    fn fail(&self, reason: String) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            warn!(history = %self.history, %reason, "transaction chain failed");
            state.failure = Some(reason);
        }
    }

    fn close(&self) -> DatastoreResult<()> {
        let (cohorts, shards) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(open) = state.open {
                return Err(DatastoreError::chain_state(
                    self.history.clone(),
                    format!("cannot close while transaction {open} is open"),
                ));
            }
            state.closed = true;
            let cohorts: Vec<CommitCohort> = state
                .readied
                .iter()
                .flat_map(|t| t.cohorts.iter().cloned())
                .collect();
            let shards: Vec<ShardName> = state.next_on_shard.keys().cloned().collect();
            (cohorts, shards)
        };

        info!(history = %self.history, shards = shards.len(), "closing transaction chain");
        if shards.is_empty() {
            self.close_done.send_replace(true);
            return Ok(());
        }

        let history = self.history.clone();
        let directory = Arc::clone(&self.context.directory);
        let done = self.close_done.clone();
        tokio::spawn(async move {
            for cohort in &cohorts {
                cohort.settled().await;
            }
            for shard in &shards {
                let closed = match directory.find_primary(shard, true).await {
                    Ok(leader) => leader.close_history(history.clone()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = closed {
                    warn!(%history, %shard, error = %e, "failed to close history on shard");
                }
            }
            done.send_replace(true);
        });
        Ok(())
    }
}

/// A sequence of transactions from one client session.
///
/// Transactions run one at a time: a new one can be opened once the
/// previous one has been readied or cancelled. A transaction observes the
/// writes of every readied predecessor, committed or not. If any readied
/// transaction fails or aborts, the chain fails and refuses new
/// transactions.
pub struct TransactionChain {
    inner: Arc<ChainInner>,
}

impl fmt::Debug for TransactionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionChain")
            .field("history", &self.inner.history)
            .finish_non_exhaustive()
    }
}

impl TransactionChain {
    pub(crate) fn new(history: HistoryId, context: Arc<TransactionContext>) -> Self {
        let (close_done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChainInner {
                history,
                context,
                state: Mutex::new(ChainState::default()),
                close_done,
            }),
        }
    }

    /// History identifier shared by all transactions of this chain.
    #[must_use]
    pub fn history(&self) -> &HistoryId {
        &self.inner.history
    }

    /// Opens a read-only transaction.
    ///
    /// # Errors
    ///
    /// `ChainState` if the chain is closed, failed or has an open
    /// transaction.
    pub fn new_read_only_transaction(&self) -> DatastoreResult<TransactionHandle> {
        self.inner.open_transaction(TransactionKind::ReadOnly)
    }

    /// Opens a write-only transaction.
    ///
    /// # Errors
    ///
    /// As [`new_read_only_transaction`](Self::new_read_only_transaction).
    pub fn new_write_only_transaction(&self) -> DatastoreResult<TransactionHandle> {
        self.inner.open_transaction(TransactionKind::WriteOnly)
    }

    /// Opens a read-write transaction.
    ///
    /// # Errors
    ///
    /// As [`new_read_only_transaction`](Self::new_read_only_transaction).
    pub fn new_read_write_transaction(&self) -> DatastoreResult<TransactionHandle> {
        self.inner.open_transaction(TransactionKind::ReadWrite)
    }

    /// Closes the chain. Once every readied transaction has been
    /// acknowledged, each shard the chain wrote to is told to close the
    /// history. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// `ChainState` if a transaction is still open.
    pub fn close(&self) -> DatastoreResult<()> {
        self.inner.close()
    }

    /// Waits until a closed chain has notified every shard it wrote to.
    pub async fn closed(&self) {
        let mut done = self.inner.close_done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Returns true once [`close`](Self::close) succeeded.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns true if a readied transaction of this chain failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failure.is_some()
    }
}
