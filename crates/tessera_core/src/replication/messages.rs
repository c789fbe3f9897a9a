//! Requests exchanged between replicas of one partition.

use super::LogEntry;
use crate::snapshot::PartitionSnapshot;
use crate::types::{LogIndex, MemberName, ShardName, Term};

/// Leader to follower: append entries (empty for a heartbeat).
#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    /// Partition.
    pub shard: ShardName,
    /// Leader's term.
    pub term: Term,
    /// Sending leader.
    pub leader: MemberName,
    /// Index of the entry preceding `entries`.
    pub prev_index: LogIndex,
    /// Term of that entry.
    pub prev_term: Term,
    /// Entries to store.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Follower's answer to [`AppendEntriesRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Follower's term.
    pub term: Term,
    /// Whether the entries were stored.
    pub success: bool,
    /// Follower's last log index after handling the request.
    pub last_index: LogIndex,
}

/// Leader to follower: replace state with a snapshot the follower's log
/// can no longer be caught up from.
#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Sending leader.
    pub leader: MemberName,
    /// Snapshot to install.
    pub snapshot: PartitionSnapshot,
}

/// Follower's answer to [`InstallSnapshotRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    /// Follower's term.
    pub term: Term,
    /// Whether the snapshot was installed.
    pub success: bool,
    /// Follower's last log index afterwards.
    pub last_index: LogIndex,
}
