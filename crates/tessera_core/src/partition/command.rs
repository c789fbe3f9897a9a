//! Messages accepted by a partition task.

use super::validator::CommitValidator;
use super::PartitionStatus;
use crate::error::{DatastoreError, DatastoreResult};
use crate::replication::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::tree::{Modification, Node, Path};
use crate::types::{HistoryId, LogIndex, MemberName, ParticipatingShards, Term, TransactionId};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<DatastoreResult<T>>;

/// A request to a partition. Every variant carries its own reply channel,
/// so a command can be held or forwarded to another replica intact.
pub(crate) enum Command {
    Ready {
        txid: TransactionId,
        shards: ParticipatingShards,
        modifications: Vec<Modification>,
        skipped: Vec<Range<u64>>,
        reply: Reply<()>,
    },
    CanCommit {
        txid: TransactionId,
        reply: Reply<()>,
    },
    Commit {
        txid: TransactionId,
        reply: Reply<()>,
    },
    Abort {
        txid: TransactionId,
        reply: Reply<()>,
    },
    Read {
        path: Path,
        reply: Reply<Option<Node>>,
    },
    CloseHistory {
        history: HistoryId,
        reply: Reply<()>,
    },
    RegisterValidator {
        validator: Arc<dyn CommitValidator>,
        reply: Reply<()>,
    },
    BecomeLeader {
        term: Term,
        followers: Vec<MemberName>,
        reply: Reply<()>,
    },
    BecomeFollower {
        term: Term,
        leader: Option<MemberName>,
        reply: Reply<()>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        reply: oneshot::Sender<InstallSnapshotResponse>,
    },
    SnapshotNow {
        reply: Reply<LogIndex>,
    },
    Status {
        reply: oneshot::Sender<PartitionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    /// Returns true for requests only the leader may serve.
    pub fn requires_leader(&self) -> bool {
        matches!(
            self,
            Self::Ready { .. }
                | Self::CanCommit { .. }
                | Self::Commit { .. }
                | Self::Abort { .. }
                | Self::Read { .. }
                | Self::CloseHistory { .. }
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::CanCommit { .. } => "can_commit",
            Self::Commit { .. } => "commit",
            Self::Abort { .. } => "abort",
            Self::Read { .. } => "read",
            Self::CloseHistory { .. } => "close_history",
            Self::RegisterValidator { .. } => "register_validator",
            Self::BecomeLeader { .. } => "become_leader",
            Self::BecomeFollower { .. } => "become_follower",
            Self::AppendEntries { .. } => "append_entries",
            Self::InstallSnapshot { .. } => "install_snapshot",
            Self::SnapshotNow { .. } => "snapshot_now",
            Self::Status { .. } => "status",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// Answers the command with `error`. Replication requests, which have
    /// no error channel, are dropped so the sender sees a closed reply.
    pub fn fail(self, error: DatastoreError) {
        match self {
            Self::Ready { reply, .. }
            | Self::CanCommit { reply, .. }
            | Self::Commit { reply, .. }
            | Self::Abort { reply, .. }
            | Self::CloseHistory { reply, .. }
            | Self::RegisterValidator { reply, .. }
            | Self::BecomeLeader { reply, .. }
            | Self::BecomeFollower { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::SnapshotNow { reply } => {
                let _ = reply.send(Err(error));
            }
            Self::AppendEntries { .. }
            | Self::InstallSnapshot { .. }
            | Self::Status { .. }
            | Self::Shutdown { .. } => {}
        }
    }
}

/// Results of requests a partition task sent to its peers.
pub(crate) enum Event {
    AppendEntriesResult {
        follower: MemberName,
        term: Term,
        result: DatastoreResult<AppendEntriesResponse>,
    },
    InstallSnapshotResult {
        follower: MemberName,
        term: Term,
        result: DatastoreResult<InstallSnapshotResponse>,
    },
}
