//! Caller-facing transaction handle.

use super::state::{StagedWrites, TransactionKind, TransactionShared, TransactionState};
use super::TransactionContext;
use crate::cohort::{CommitCohort, ReadyRequest};
use crate::coordinator::CohortCoordinator;
use crate::error::{DatastoreError, DatastoreResult};
use crate::tree::{self, Modification, Node, Path};
use crate::types::{ParticipatingShards, ShardName, TransactionId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// An open transaction.
///
/// Writes are staged locally, grouped by shard, until
/// [`ready`](Self::ready). Reads go to the shard's leader and see this
/// transaction's own staged writes, plus, inside a chain, the writes of
/// readied predecessors.
///
/// Dropping an open handle cancels it.
pub struct TransactionHandle {
    shared: Arc<TransactionShared>,
    kind: TransactionKind,
    context: Arc<TransactionContext>,
    staged: StagedWrites,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("txid", self.shared.txid())
            .field("kind", &self.kind)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl TransactionHandle {
    pub(crate) fn new(
        shared: Arc<TransactionShared>,
        kind: TransactionKind,
        context: Arc<TransactionContext>,
    ) -> Self {
        Self {
            shared,
            kind,
            context,
            staged: StagedWrites::default(),
        }
    }

    /// Transaction identifier.
    #[must_use]
    pub fn txid(&self) -> &TransactionId {
        self.shared.txid()
    }

    /// What this transaction may do.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    /// Stages replacing the node at `path` with `data`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a read-only transaction, `AlreadyReadied` or
    /// `TransactionClosed` if it is no longer open, `ChainState` if a chain
    /// predecessor on the same shard failed.
    pub async fn write(&mut self, path: Path, data: Node) -> DatastoreResult<()> {
        self.stage(Modification::Write { path, data }).await
    }

    /// Stages merging `data` into the node at `path`.
    ///
    /// # Errors
    ///
    /// As [`write`](Self::write).
    pub async fn merge(&mut self, path: Path, data: Node) -> DatastoreResult<()> {
        self.stage(Modification::Merge { path, data }).await
    }

    /// Stages removing the node at `path`.
    ///
    /// # Errors
    ///
    /// As [`write`](Self::write).
    pub async fn delete(&mut self, path: Path) -> DatastoreResult<()> {
        self.stage(Modification::Delete { path }).await
    }

    async fn stage(&mut self, modification: Modification) -> DatastoreResult<()> {
        if !self.kind.can_write() {
            return Err(DatastoreError::invalid_operation(format!(
                "{} transaction {} cannot write",
                self.kind,
                self.txid()
            )));
        }
        self.shared.check_open()?;
        let shard = self.context.strategy.shard_for(modification.path());
        self.await_chain(&shard).await?;

        trace!(txid = %self.txid(), %shard, path = %modification.path(), "staged");
        self.staged.push(shard, modification);
        Ok(())
    }

    /// Reads the node at `path`.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a write-only transaction, lifecycle errors as
    /// for [`write`](Self::write), and any error finding or reading from
    /// the shard's leader.
    pub async fn read(&self, path: &Path) -> DatastoreResult<Option<Node>> {
        if !self.kind.can_read() {
            return Err(DatastoreError::invalid_operation(format!(
                "{} transaction {} cannot read",
                self.kind,
                self.txid()
            )));
        }
        self.shared.check_open()?;
        let shard = self.context.strategy.shard_for(path);
        self.await_chain(&shard).await?;

        let leader = self.context.directory.find_primary(&shard, true).await?;
        let base = leader.read(path.clone()).await?;

        let mut pending = self
            .shared
            .chain()
            .map(|chain| chain.pending_modifications(&shard))
            .unwrap_or_default();
        pending.extend_from_slice(self.staged.for_shard(&shard));
        if pending.is_empty() {
            return Ok(base);
        }
        tree::overlay(path, base, &pending)
    }

    /// Returns true if a node exists at `path`.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    pub async fn exists(&self, path: &Path) -> DatastoreResult<bool> {
        Ok(self.read(path).await?.is_some())
    }

    async fn await_chain(&self, shard: &ShardName) -> DatastoreResult<()> {
        match self.shared.chain() {
            Some(chain) => chain.await_predecessors(shard).await,
            None => Ok(()),
        }
    }

    /// Freezes the participating shards, sends every shard its staged
    /// modifications and returns the coordinator for the commit.
    ///
    /// A transaction with no writes readies with no cohorts and commits
    /// trivially.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a read-only transaction, lifecycle errors as
    /// for [`write`](Self::write), `ChainState` if the chain failed.
    pub fn ready(&mut self) -> DatastoreResult<CohortCoordinator> {
        if !self.kind.can_write() {
            return Err(DatastoreError::invalid_operation(format!(
                "{} transaction {} cannot be readied",
                self.kind,
                self.txid()
            )));
        }
        self.shared.check_open()?;

        let staged = self.staged.take();
        let txid = self.txid().clone();
        let cohorts = match self.shared.chain() {
            Some(chain) => match chain.ready(&txid, staged) {
                Ok(cohorts) => cohorts,
                Err(e) => {
                    self.shared.cancel();
                    return Err(e);
                }
            },
            None => self.spawn_cohorts(&txid, staged),
        };
        self.shared.mark_readied()?;

        debug!(%txid, cohorts = cohorts.len(), "transaction readied");
        Ok(CohortCoordinator::new(
            Arc::clone(&self.shared),
            cohorts,
            self.context.config.transaction_commit_timeout,
        ))
    }

    fn spawn_cohorts(
        &self,
        txid: &TransactionId,
        staged: BTreeMap<ShardName, Vec<Modification>>,
    ) -> Vec<CommitCohort> {
        let shards = ParticipatingShards::new(staged.keys().cloned());
        let mut skipped_by_shard = match self.shared.sequencer() {
            Some(sequencer) => sequencer.readied(txid.seq, staged.keys()),
            None => BTreeMap::new(),
        };
        let timeout = self.context.config.transaction_commit_timeout;
        staged
            .into_iter()
            .map(|(shard, modifications)| {
                let skipped = skipped_by_shard.remove(&shard).unwrap_or_default();
                CommitCohort::spawn(
                    ReadyRequest {
                        txid: txid.clone(),
                        shard,
                        shards: shards.clone(),
                        modifications,
                        skipped,
                        predecessors: Vec::new(),
                    },
                    Arc::clone(&self.context.directory),
                    timeout,
                )
            })
            .collect()
    }

    /// Closes the transaction without committing. Staged writes are
    /// discarded. This is how a read-only transaction ends.
    ///
    /// # Errors
    ///
    /// `AlreadyReadied` or `TransactionClosed` if it is no longer open.
    pub fn cancel(&mut self) -> DatastoreResult<()> {
        self.shared.check_open()?;
        self.staged.take();
        self.shared.cancel();
        debug!(txid = %self.txid(), "transaction cancelled");
        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.shared.cancel() {
            trace!(txid = %self.shared.txid(), "open transaction dropped");
        }
    }
}
