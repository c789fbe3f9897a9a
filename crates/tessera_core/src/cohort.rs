//! One partition's share of a transaction commit.

use crate::directory::PartitionDirectory;
use crate::error::{CommitPhase, DatastoreError, DatastoreResult};
use crate::partition::PartitionHandle;
use crate::tree::Modification;
use crate::types::{ParticipatingShards, ShardName, TransactionId};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Progress of a cohort's `ready` request.
#[derive(Debug, Clone)]
pub enum ReadyOutcome {
    /// Not answered yet.
    Pending,
    /// The leader queued the transaction.
    Ready(PartitionHandle),
    /// The transaction never reached the partition's queue.
    Failed(DatastoreError),
}

impl ReadyOutcome {
    fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What a cohort sends to its partition at `ready`.
pub(crate) struct ReadyRequest {
    pub txid: TransactionId,
    pub shard: ShardName,
    pub shards: ParticipatingShards,
    pub modifications: Vec<Modification>,
    pub skipped: Vec<Range<u64>>,
    /// Cohorts of earlier chain transactions on the same shard; their
    /// `ready` must settle first.
    pub predecessors: Vec<CommitCohort>,
}

/// Participant handle for one transaction on one partition.
///
/// Created when the transaction is readied. The `ready` request runs in
/// the background; every phase first waits for its outcome.
#[derive(Clone)]
pub struct CommitCohort {
    txid: TransactionId,
    shard: ShardName,
    modifications: Arc<[Modification]>,
    outcome: watch::Receiver<ReadyOutcome>,
}

impl fmt::Debug for CommitCohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCohort")
            .field("txid", &self.txid)
            .field("shard", &self.shard)
            .field("modifications", &self.modifications.len())
            .finish_non_exhaustive()
    }
}

impl CommitCohort {
    /// Sends `request` to the shard's leader in a background task.
    pub(crate) fn spawn(
        request: ReadyRequest,
        directory: Arc<PartitionDirectory>,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(ReadyOutcome::Pending);
        let cohort = Self {
            txid: request.txid.clone(),
            shard: request.shard.clone(),
            modifications: request.modifications.clone().into(),
            outcome: rx,
        };

        tokio::spawn(async move {
            let txid = request.txid.clone();
            let shard = request.shard.clone();
            let outcome = match tokio::time::timeout(timeout, send_ready(request, &directory)).await {
                Ok(Ok(handle)) => {
                    trace!(%txid, %shard, "cohort ready");
                    ReadyOutcome::Ready(handle)
                }
                Ok(Err(e)) => {
                    debug!(%txid, %shard, error = %e, "cohort ready failed");
                    ReadyOutcome::Failed(e)
                }
                Err(_) => ReadyOutcome::Failed(DatastoreError::timeout(format!(
                    "ready of transaction {txid} on shard {shard} timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            tx.send_replace(outcome);
        });
        cohort
    }

    /// Transaction.
    #[must_use]
    pub fn txid(&self) -> &TransactionId {
        &self.txid
    }

    /// Partition.
    #[must_use]
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// Modifications sent to the partition.
    #[must_use]
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// Current outcome of the `ready` request.
    #[must_use]
    pub fn ready_outcome(&self) -> ReadyOutcome {
        self.outcome.borrow().clone()
    }

    /// Waits for the `ready` request to settle.
    pub async fn settled(&self) -> ReadyOutcome {
        let mut outcome = self.outcome.clone();
        let settled = outcome
            .wait_for(ReadyOutcome::is_settled)
            .await
            .map(|o| (*o).clone());
        settled.unwrap_or_else(|_| {
            ReadyOutcome::Failed(DatastoreError::invalid_operation(format!(
                "ready task of transaction {} on shard {} ended without an answer",
                self.txid, self.shard
            )))
        })
    }

    async fn leader(&self, phase: CommitPhase) -> DatastoreResult<PartitionHandle> {
        match self.settled().await {
            ReadyOutcome::Ready(handle) => Ok(handle),
            ReadyOutcome::Failed(e) => Err(self.failure(CommitPhase::Ready, e)),
            ReadyOutcome::Pending => Err(self.failure(
                phase,
                DatastoreError::invalid_operation("ready did not settle"),
            )),
        }
    }

    /// Asks the partition whether the transaction can commit.
    ///
    /// # Errors
    ///
    /// A `CohortPhaseFailure` naming this shard and the cause.
    pub async fn can_commit(&self) -> DatastoreResult<()> {
        let handle = self.leader(CommitPhase::CanCommit).await?;
        handle
            .can_commit(self.txid.clone())
            .await
            .map_err(|e| self.failure(CommitPhase::CanCommit, e))
    }

    /// Commits on the partition.
    ///
    /// # Errors
    ///
    /// A `CohortPhaseFailure` naming this shard and the cause.
    pub async fn commit(&self) -> DatastoreResult<()> {
        let handle = self.leader(CommitPhase::Commit).await?;
        handle
            .commit(self.txid.clone())
            .await
            .map_err(|e| self.failure(CommitPhase::Commit, e))
    }

    /// Aborts on the partition. A transaction that never became ready has
    /// nothing to abort.
    ///
    /// # Errors
    ///
    /// A `CohortPhaseFailure` naming this shard and the cause.
    pub async fn abort(&self) -> DatastoreResult<()> {
        match self.settled().await {
            ReadyOutcome::Ready(handle) => handle
                .abort(self.txid.clone())
                .await
                .map_err(|e| self.failure(CommitPhase::Abort, e)),
            ReadyOutcome::Failed(_) | ReadyOutcome::Pending => Ok(()),
        }
    }

    fn failure(&self, phase: CommitPhase, cause: DatastoreError) -> DatastoreError {
        DatastoreError::phase_failure(phase, self.txid.clone(), self.shard.clone(), cause)
    }
}

async fn send_ready(
    request: ReadyRequest,
    directory: &PartitionDirectory,
) -> DatastoreResult<PartitionHandle> {
    for predecessor in &request.predecessors {
        if let ReadyOutcome::Failed(e) = predecessor.settled().await {
            return Err(DatastoreError::chain_state(
                request.txid.history.clone(),
                format!(
                    "previous transaction {} failed to become ready: {e}",
                    predecessor.txid()
                ),
            ));
        }
    }

    let handle = directory.find_primary(&request.shard, true).await?;
    handle
        .ready(
            request.txid,
            request.shards,
            request.modifications,
            request.skipped,
        )
        .await?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::config::DatastoreConfig;
    use crate::partition::PartitionSpec;
    use crate::tree::{Node, Path};
    use crate::types::{ClientId, HistoryId, MemberName};

    fn txid(seq: u64) -> TransactionId {
        TransactionId::new(
            HistoryId::standalone(ClientId::new(MemberName::new("m1"), 0)),
            seq,
        )
    }

    async fn directory() -> Arc<PartitionDirectory> {
        let cluster = Arc::new(LocalCluster::new());
        let dir = PartitionDirectory::in_cluster(
            MemberName::new("m1"),
            DatastoreConfig::for_testing(),
            &cluster,
        )
        .unwrap();
        dir.create_partition(
            ShardName::new("default"),
            PartitionSpec::in_memory(vec![MemberName::new("m1")]),
        )
        .unwrap();
        dir
    }

    fn request(seq: u64, shard: &str, modifications: Vec<Modification>) -> ReadyRequest {
        let shard = ShardName::new(shard);
        ReadyRequest {
            txid: txid(seq),
            shards: ParticipatingShards::new([shard.clone()]),
            shard,
            modifications,
            skipped: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cohort_runs_all_phases() {
        let dir = directory().await;
        let write = Modification::Write {
            path: Path::parse("/a"),
            data: Node::leaf("1"),
        };
        let cohort = CommitCohort::spawn(
            request(0, "default", vec![write]),
            dir.clone(),
            Duration::from_secs(5),
        );

        assert!(matches!(cohort.settled().await, ReadyOutcome::Ready(_)));
        cohort.can_commit().await.unwrap();
        cohort.commit().await.unwrap();

        let leader = dir
            .find_primary(&ShardName::new("default"), true)
            .await
            .unwrap();
        let read = leader.read(Path::parse("/a")).await.unwrap();
        assert_eq!(read, Some(Node::leaf("1")));
        dir.shutdown().await;
    }

    #[tokio::test]
    async fn ready_failure_surfaces_as_ready_phase() {
        let dir = directory().await;
        let cohort = CommitCohort::spawn(
            request(0, "missing", Vec::new()),
            dir.clone(),
            Duration::from_secs(5),
        );

        let err = cohort.can_commit().await.unwrap_err();
        match err {
            DatastoreError::CohortPhaseFailure { phase, cause, .. } => {
                assert_eq!(phase, CommitPhase::Ready);
                assert!(matches!(*cause, DatastoreError::ShardNotFound { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was queued, so there is nothing to abort.
        cohort.abort().await.unwrap();
        dir.shutdown().await;
    }
}
