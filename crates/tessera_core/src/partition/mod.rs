//! Replicated partitions.
//!
//! A partition owns one shard of the data tree on one member. All of its
//! state (tree, commit queue, replicated log, frontend metadata) lives in a
//! single task and is reached only through a [`PartitionHandle`], which
//! sends commands over a channel. Commands are handled one at a time in
//! arrival order.
//!
//! # Roles
//!
//! Leadership is assigned from outside with
//! [`become_leader`](PartitionHandle::become_leader) and
//! [`become_follower`](PartitionHandle::become_follower); a partition whose
//! only voter is its own member leads itself after recovery. Only the
//! leader serves transaction requests. A follower forwards them to the
//! leader it knows, answers `NotLeader` when forwarding is disabled, or
//! holds them until a leader appears and fails them with `NoLeader` after
//! the leader election timeout.
//!
//! A leader that has not heard from enough followers within the isolated
//! leader check interval becomes an isolated leader and rejects `ready`,
//! `can_commit` and `commit` with `IsolatedLeader` until contact returns.

mod actor;
mod command;
mod recovery;
mod replicate;
mod state;
mod validator;

pub use validator::CommitValidator;

pub(crate) use command::Command;

use crate::cluster::{ClusterMembership, ReplicationTransport};
use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, DatastoreResult};
use crate::replication::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::tree::{Modification, Node, Path};
use crate::types::{
    HistoryId, LogIndex, MemberName, ParticipatingShards, ShardName, Term, TransactionId,
};
use actor::PartitionActor;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tessera_storage::{InMemoryBackend, StorageBackend};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Replication role of a partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    /// Follows a leader (or waits for one).
    Follower,
    /// Leads and accepts transactions.
    Leader,
    /// Leads but cannot reach enough followers; rejects new commits.
    IsolatedLeader,
}

impl ShardRole {
    /// Returns true for both leader roles.
    #[must_use]
    pub fn is_leader(self) -> bool {
        !matches!(self, Self::Follower)
    }
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Leader => write!(f, "leader"),
            Self::IsolatedLeader => write!(f, "isolated-leader"),
        }
    }
}

/// Published view of a replica's role, for directory lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    /// Recovery has finished.
    pub initialized: bool,
    /// Current role.
    pub role: ShardRole,
    /// Current term.
    pub term: Term,
    /// Known leader (the replica itself when leading).
    pub leader: Option<MemberName>,
}

impl ShardStatus {
    fn starting() -> Self {
        Self {
            initialized: false,
            role: ShardRole::Follower,
            term: Term::default(),
            leader: None,
        }
    }
}

/// Detailed snapshot of a replica's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    /// Partition.
    pub shard: ShardName,
    /// Hosting member.
    pub member: MemberName,
    /// Current role.
    pub role: ShardRole,
    /// Current term.
    pub term: Term,
    /// Known leader.
    pub leader: Option<MemberName>,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub last_applied: LogIndex,
    /// Index covered by the latest snapshot.
    pub snapshot_index: LogIndex,
    /// Snapshots captured or installed since start.
    pub snapshots_taken: u64,
    /// Log entries retained since the latest snapshot.
    pub log_entries: usize,
    /// Transactions waiting in the commit queue.
    pub queue_len: usize,
    /// Transactions whose commit is being replicated.
    pub replicating_len: usize,
    /// Histories the frontend metadata still tracks.
    pub live_histories: Vec<HistoryId>,
    /// Histories dropped for good.
    pub purged_histories: Vec<HistoryId>,
    /// Purged sequence ranges of every live history.
    pub purged_ranges: BTreeMap<HistoryId, Vec<Range<u64>>>,
}

/// Everything needed to host one replica of a partition.
pub struct PartitionSpec {
    voters: Vec<MemberName>,
    journal: Box<dyn StorageBackend>,
    snapshots: Box<dyn StorageBackend>,
}

impl PartitionSpec {
    /// Creates a spec over explicit journal and snapshot backends.
    pub fn new(
        voters: Vec<MemberName>,
        journal: Box<dyn StorageBackend>,
        snapshots: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            voters,
            journal,
            snapshots,
        }
    }

    /// Creates a spec with fresh in-memory storage.
    pub fn in_memory(voters: Vec<MemberName>) -> Self {
        Self::new(
            voters,
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    /// Voting members of the partition.
    #[must_use]
    pub fn voters(&self) -> &[MemberName] {
        &self.voters
    }
}

impl fmt::Debug for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSpec")
            .field("voters", &self.voters)
            .finish_non_exhaustive()
    }
}

/// Starts a partition task.
pub(crate) fn spawn(
    shard: ShardName,
    member: MemberName,
    spec: PartitionSpec,
    config: DatastoreConfig,
    transport: Arc<dyn ReplicationTransport>,
    membership: Arc<dyn ClusterMembership>,
) -> (PartitionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (status_tx, status_rx) = watch::channel(ShardStatus::starting());

    let handle = PartitionHandle {
        shard: shard.clone(),
        member: member.clone(),
        commands: commands_tx,
        status: status_rx,
        operation_timeout: config.operation_timeout,
    };
    let actor = PartitionActor::new(
        shard, member, spec, config, commands_rx, status_tx, transport, membership,
    );
    let task = tokio::spawn(actor.run());
    (handle, task)
}

/// Cloneable address of a partition replica.
#[derive(Clone)]
pub struct PartitionHandle {
    shard: ShardName,
    member: MemberName,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ShardStatus>,
    operation_timeout: Duration,
}

impl fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("shard", &self.shard)
            .field("member", &self.member)
            .finish_non_exhaustive()
    }
}

impl PartitionHandle {
    /// Partition name.
    #[must_use]
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// Hosting member.
    #[must_use]
    pub fn member(&self) -> &MemberName {
        &self.member
    }

    /// Latest published role information.
    #[must_use]
    pub fn shard_status(&self) -> ShardStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to role changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShardStatus> {
        self.status.clone()
    }

    /// Returns true once the task has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    /// Enqueues a readied transaction. `skipped` names sequence numbers of
    /// the same history that will never reach this partition, so its purged
    /// ranges stay contiguous.
    ///
    /// # Errors
    ///
    /// `CommitQueueCapacityExceeded`, `IsolatedLeader`, `NoLeader` or
    /// `NotLeader`, among others.
    pub async fn ready(
        &self,
        txid: TransactionId,
        shards: ParticipatingShards,
        modifications: Vec<Modification>,
        skipped: Vec<Range<u64>>,
    ) -> DatastoreResult<()> {
        self.call(|reply| Command::Ready {
            txid,
            shards,
            modifications,
            skipped,
            reply,
        })
        .await
    }

    /// Requests `can_commit`. The reply may be held until the transaction
    /// reaches the head of the commit queue.
    ///
    /// # Errors
    ///
    /// `UnknownTransaction` if the transaction was never readied here, or
    /// the validation failure that vetoed it.
    pub async fn can_commit(&self, txid: TransactionId) -> DatastoreResult<()> {
        self.call(|reply| Command::CanCommit { txid, reply }).await
    }

    /// Commits the transaction at the head of the queue. Answers once the
    /// commit is replicated and applied.
    ///
    /// # Errors
    ///
    /// Fails unless the transaction passed `can_commit`.
    pub async fn commit(&self, txid: TransactionId) -> DatastoreResult<()> {
        self.call(|reply| Command::Commit { txid, reply }).await
    }

    /// Aborts a queued transaction. Unknown transactions are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is already replicating its commit.
    pub async fn abort(&self, txid: TransactionId) -> DatastoreResult<()> {
        self.call(|reply| Command::Abort { txid, reply }).await
    }

    /// Reads committed data.
    ///
    /// # Errors
    ///
    /// Fails if no leader can serve the read.
    pub async fn read(&self, path: Path) -> DatastoreResult<Option<Node>> {
        self.call(|reply| Command::Read { path, reply }).await
    }

    /// Returns true if committed data exists at `path`.
    ///
    /// # Errors
    ///
    /// Fails if no leader can serve the read.
    pub async fn exists(&self, path: Path) -> DatastoreResult<bool> {
        Ok(self.read(path).await?.is_some())
    }

    /// Records that a chain history was closed by its client.
    ///
    /// # Errors
    ///
    /// Fails if no leader can accept it.
    pub async fn close_history(&self, history: HistoryId) -> DatastoreResult<()> {
        self.call(|reply| Command::CloseHistory { history, reply })
            .await
    }

    /// Adds a commit validator to this replica.
    ///
    /// # Errors
    ///
    /// Fails if the partition stopped.
    pub async fn register_validator(
        &self,
        validator: Arc<dyn CommitValidator>,
    ) -> DatastoreResult<()> {
        self.call_timed("register_validator", |reply| Command::RegisterValidator {
            validator,
            reply,
        })
        .await
    }

    /// Makes this replica leader for `term`, replicating to `followers`.
    ///
    /// # Errors
    ///
    /// Fails for a term older than the current one.
    pub async fn become_leader(&self, term: Term, followers: Vec<MemberName>) -> DatastoreResult<()> {
        self.call_timed("become_leader", |reply| Command::BecomeLeader {
            term,
            followers,
            reply,
        })
        .await
    }

    /// Makes this replica a follower of `leader` (or of nobody yet).
    ///
    /// # Errors
    ///
    /// Fails for a term older than the current one.
    pub async fn become_follower(
        &self,
        term: Term,
        leader: Option<MemberName>,
    ) -> DatastoreResult<()> {
        self.call_timed("become_follower", |reply| Command::BecomeFollower {
            term,
            leader,
            reply,
        })
        .await
    }

    /// Delivers an append request from the leader.
    ///
    /// # Errors
    ///
    /// Fails if the partition stopped or did not answer in time.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> DatastoreResult<AppendEntriesResponse> {
        self.exchange_timed("append_entries", |reply| Command::AppendEntries {
            request,
            reply,
        })
        .await
    }

    /// Delivers a snapshot from the leader.
    ///
    /// # Errors
    ///
    /// Fails if the partition stopped or did not answer in time.
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> DatastoreResult<InstallSnapshotResponse> {
        self.exchange_timed("install_snapshot", |reply| Command::InstallSnapshot {
            request,
            reply,
        })
        .await
    }

    /// Captures a snapshot now and returns the index it covers.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be stored.
    pub async fn snapshot_now(&self) -> DatastoreResult<LogIndex> {
        self.call_timed("snapshot_now", |reply| Command::SnapshotNow { reply })
            .await
    }

    /// Returns detailed progress information.
    ///
    /// # Errors
    ///
    /// Fails if the partition stopped.
    pub async fn status(&self) -> DatastoreResult<PartitionStatus> {
        self.exchange_timed("status", |reply| Command::Status { reply })
            .await
    }

    /// Stops the partition task, failing everything it holds.
    ///
    /// # Errors
    ///
    /// Fails if the task already stopped.
    pub async fn shutdown(&self) -> DatastoreResult<()> {
        self.exchange_timed("shutdown", |reply| Command::Shutdown { reply })
            .await
    }

    /// Hands a command (with its reply channel) to this replica.
    pub(crate) async fn forward(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command).await {
            command.fail(self.stopped());
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<DatastoreResult<T>>) -> Command,
    ) -> DatastoreResult<T> {
        self.exchange(make).await?
    }

    async fn call_timed<T>(
        &self,
        operation: &str,
        make: impl FnOnce(oneshot::Sender<DatastoreResult<T>>) -> Command,
    ) -> DatastoreResult<T> {
        self.exchange_timed(operation, make).await?
    }

    async fn exchange<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DatastoreResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    async fn exchange_timed<T>(
        &self,
        operation: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DatastoreResult<T> {
        tokio::time::timeout(self.operation_timeout, self.exchange(make))
            .await
            .map_err(|_| {
                DatastoreError::timeout(format!(
                    "{operation} on shard {} at {} timed out after {}ms",
                    self.shard,
                    self.member,
                    self.operation_timeout.as_millis()
                ))
            })?
    }

    fn stopped(&self) -> DatastoreError {
        DatastoreError::PartitionStopped {
            shard: self.shard.clone(),
            member: self.member.clone(),
        }
    }
}
