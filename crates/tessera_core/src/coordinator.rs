//! Three-phase commit across the cohorts of one transaction.
//!
//! `can_commit` visits the cohorts one after another in participating-shard
//! order, which is the order every partition's commit queue relies on to
//! avoid circular waits. It stops at the first refusal and aborts every
//! cohort. `pre_commit` has no remote step: a partition pre-commits as part
//! of its commit. `commit` and `abort` contact all cohorts at once. A
//! failed commit is reported but not rolled back on the cohorts that
//! already committed.

use crate::cohort::CommitCohort;
use crate::error::{DatastoreError, DatastoreResult};
use crate::transaction::TransactionShared;
use crate::types::{ParticipatingShards, TransactionId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Where a coordinator is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    /// Readied, no phase run yet.
    Readied,
    /// Every cohort voted yes.
    CanCommitted,
    /// Pre-commit done.
    PreCommitted,
    /// Every cohort committed.
    Committed,
    /// Aborted on every cohort.
    Aborted,
    /// Commit failed on at least one cohort.
    Failed,
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Readied => "readied",
            Self::CanCommitted => "can-committed",
            Self::PreCommitted => "pre-committed",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives one transaction's cohorts through the commit protocol.
pub struct CohortCoordinator {
    transaction: Arc<TransactionShared>,
    shards: ParticipatingShards,
    cohorts: Vec<CommitCohort>,
    phase: CoordinatorPhase,
    timeout: Duration,
}

impl fmt::Debug for CohortCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortCoordinator")
            .field("txid", self.transaction.txid())
            .field("shards", &self.shards)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CohortCoordinator {
    pub(crate) fn new(
        transaction: Arc<TransactionShared>,
        mut cohorts: Vec<CommitCohort>,
        timeout: Duration,
    ) -> Self {
        cohorts.sort_by(|a, b| a.shard().cmp(b.shard()));
        let shards = ParticipatingShards::new(cohorts.iter().map(|c| c.shard().clone()));
        Self {
            transaction,
            shards,
            cohorts,
            phase: CoordinatorPhase::Readied,
            timeout,
        }
    }

    /// Transaction being committed.
    #[must_use]
    pub fn txid(&self) -> &TransactionId {
        self.transaction.txid()
    }

    /// Participating shards in protocol order.
    #[must_use]
    pub fn shards(&self) -> &ParticipatingShards {
        &self.shards
    }

    /// Cohorts in protocol order.
    #[must_use]
    pub fn cohorts(&self) -> &[CommitCohort] {
        &self.cohorts
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    /// Asks every cohort, in shard order, whether the transaction can
    /// commit. On the first failure every cohort is aborted and the
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// `CohortPhaseFailure` for a refusal, `Timeout` if the phase ran out
    /// of time, `InvalidOperation` if called out of order.
    pub async fn can_commit(&mut self) -> DatastoreResult<()> {
        self.expect_phase(CoordinatorPhase::Readied, "can_commit")?;
        debug!(txid = %self.txid(), shards = %self.shards, "can_commit");

        let cohorts = self.cohorts.clone();
        let sequential = async move {
            for cohort in &cohorts {
                cohort.can_commit().await?;
            }
            Ok(())
        };
        match self.timed("can_commit", sequential).await {
            Ok(()) => {
                self.phase = CoordinatorPhase::CanCommitted;
                Ok(())
            }
            Err(e) => {
                debug!(txid = %self.txid(), error = %e, "can_commit failed, aborting");
                self.abort_cohorts().await;
                self.phase = CoordinatorPhase::Aborted;
                self.transaction.finish(false);
                Err(e)
            }
        }
    }

    /// Pre-commit needs no round trip; partitions pre-commit as part of
    /// their commit.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if `can_commit` has not succeeded.
    pub async fn pre_commit(&mut self) -> DatastoreResult<()> {
        self.expect_phase(CoordinatorPhase::CanCommitted, "pre_commit")?;
        self.phase = CoordinatorPhase::PreCommitted;
        Ok(())
    }

    /// Commits on every cohort in parallel.
    ///
    /// # Errors
    ///
    /// The first cohort failure. Cohorts that committed stay committed.
    pub async fn commit(&mut self) -> DatastoreResult<()> {
        self.expect_phase(CoordinatorPhase::PreCommitted, "commit")?;
        debug!(txid = %self.txid(), shards = %self.shards, "commit");

        let result = self
            .timed("commit", fan_out(&self.cohorts, |cohort| async move {
                cohort.commit().await
            }))
            .await;
        match result {
            Ok(()) => {
                self.phase = CoordinatorPhase::Committed;
                self.transaction.finish(true);
                debug!(txid = %self.txid(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(txid = %self.txid(), error = %e, "commit failed on at least one shard");
                self.phase = CoordinatorPhase::Failed;
                self.transaction.finish(false);
                Err(e)
            }
        }
    }

    /// Aborts on every cohort in parallel. Individual abort failures are
    /// logged and do not fail the call, so they never hide the error that
    /// led to the abort.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` after a successful commit.
    pub async fn abort(&mut self) -> DatastoreResult<()> {
        match self.phase {
            CoordinatorPhase::Committed => {
                return Err(DatastoreError::invalid_operation(format!(
                    "transaction {} is already committed",
                    self.txid()
                )))
            }
            CoordinatorPhase::Aborted => return Ok(()),
            _ => {}
        }
        self.abort_cohorts().await;
        self.phase = CoordinatorPhase::Aborted;
        self.transaction.finish(false);
        Ok(())
    }

    /// Runs `can_commit`, `pre_commit` and `commit`, aborting if either of
    /// the first two fails.
    ///
    /// # Errors
    ///
    /// The error of the first failing phase.
    pub async fn submit(mut self) -> DatastoreResult<()> {
        self.can_commit().await?;
        if let Err(e) = self.pre_commit().await {
            self.abort().await?;
            return Err(e);
        }
        self.commit().await
    }

    async fn abort_cohorts(&self) {
        let outcome = tokio::time::timeout(
            self.timeout,
            fan_out(&self.cohorts, |cohort| async move {
                let shard = cohort.shard().clone();
                if let Err(e) = cohort.abort().await {
                    warn!(txid = %cohort.txid(), %shard, error = %e, "abort failed");
                }
                Ok(())
            }),
        )
        .await;
        if outcome.is_err() {
            warn!(txid = %self.txid(), "abort did not finish in time");
        }
    }

    async fn timed<F>(&self, phase: &str, operation: F) -> DatastoreResult<()>
    where
        F: Future<Output = DatastoreResult<()>>,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .unwrap_or_else(|_| {
                Err(DatastoreError::timeout(format!(
                    "{phase} of transaction {} timed out after {}ms",
                    self.txid(),
                    self.timeout.as_millis()
                )))
            })
    }

    fn expect_phase(&self, expected: CoordinatorPhase, operation: &str) -> DatastoreResult<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(DatastoreError::invalid_operation(format!(
                "{operation} of transaction {} requires phase {expected}, found {}",
                self.txid(),
                self.phase
            )))
        }
    }
}

/// Runs `operation` on every cohort concurrently and returns the first
/// error after all of them finished.
async fn fan_out<F, Fut>(cohorts: &[CommitCohort], operation: F) -> DatastoreResult<()>
where
    F: Fn(CommitCohort) -> Fut,
    Fut: Future<Output = DatastoreResult<()>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for cohort in cohorts {
        tasks.spawn(operation(cohort.clone()));
    }
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            Err(DatastoreError::invalid_operation(format!(
                "cohort task ended abnormally: {e}"
            )))
        });
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
