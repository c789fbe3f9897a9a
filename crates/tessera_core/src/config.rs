//! Datastore configuration.

use crate::error::{DatastoreError, DatastoreResult};
use std::time::Duration;

/// Configuration shared by a member's partitions and transaction frontend.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Timeout for a single request/reply exchange with a partition.
    pub operation_timeout: Duration,

    /// Upper bound for each phase of a transaction commit.
    pub transaction_commit_timeout: Duration,

    /// How long a directory lookup may wait for a partition to initialize.
    pub shard_initialization_timeout: Duration,

    /// How long a leaderless replica holds transaction requests before
    /// failing them with `NoLeader`.
    pub leader_election_timeout: Duration,

    /// Interval between leader heartbeats (and partition housekeeping ticks).
    pub heartbeat_interval: Duration,

    /// A follower silent for longer than this no longer counts towards the
    /// leader's quorum.
    pub isolated_leader_check_interval: Duration,

    /// Maximum number of readied, unfinished transactions per partition.
    pub commit_queue_capacity: usize,

    /// Idle time after which the head of a commit queue is expired.
    pub commit_queue_expiry_timeout: Duration,

    /// Number of log entries since the last snapshot that triggers a new one.
    pub snapshot_batch_count: u64,

    /// Journal bytes since the last snapshot that trigger a new one.
    pub snapshot_data_threshold_bytes: u64,

    /// Entries applied per batch during journal recovery.
    pub journal_recovery_batch_size: usize,

    /// Whether the journal is synced after every append.
    pub sync_journal_on_append: bool,

    /// Whether followers forward transaction requests to the known leader
    /// instead of answering `NotLeader`.
    pub follower_forwarding: bool,

    /// Voting members that must hold an entry before it commits. `None`
    /// means a majority of the partition's voters.
    pub min_replication_count: Option<usize>,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_millis(500);
        Self {
            operation_timeout: Duration::from_secs(5),
            transaction_commit_timeout: Duration::from_secs(30),
            shard_initialization_timeout: Duration::from_secs(5 * 60),
            leader_election_timeout: Duration::from_secs(30),
            heartbeat_interval,
            isolated_leader_check_interval: heartbeat_interval * 10,
            commit_queue_capacity: 50_000,
            commit_queue_expiry_timeout: Duration::from_secs(2 * 60),
            snapshot_batch_count: 20_000,
            snapshot_data_threshold_bytes: 64 * 1024 * 1024, // 64 MiB
            journal_recovery_batch_size: 1_000,
            sync_journal_on_append: false,
            follower_forwarding: true,
            min_replication_count: None,
        }
    }
}

impl DatastoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timeouts for tests and simulations.
    #[must_use]
    pub fn for_testing() -> Self {
        let heartbeat_interval = Duration::from_millis(20);
        Self {
            operation_timeout: Duration::from_secs(2),
            transaction_commit_timeout: Duration::from_secs(5),
            shard_initialization_timeout: Duration::from_secs(2),
            leader_election_timeout: Duration::from_secs(1),
            heartbeat_interval,
            isolated_leader_check_interval: heartbeat_interval * 10,
            commit_queue_expiry_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Sets the per-phase commit timeout.
    #[must_use]
    pub const fn transaction_commit_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_commit_timeout = timeout;
        self
    }

    /// Sets the directory initialization wait.
    #[must_use]
    pub const fn shard_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.shard_initialization_timeout = timeout;
        self
    }

    /// Sets the leaderless hold time.
    #[must_use]
    pub const fn leader_election_timeout(mut self, timeout: Duration) -> Self {
        self.leader_election_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the follower silence threshold for isolation checks.
    #[must_use]
    pub const fn isolated_leader_check_interval(mut self, interval: Duration) -> Self {
        self.isolated_leader_check_interval = interval;
        self
    }

    /// Sets the commit queue capacity.
    #[must_use]
    pub const fn commit_queue_capacity(mut self, capacity: usize) -> Self {
        self.commit_queue_capacity = capacity;
        self
    }

    /// Sets the commit queue idle expiry.
    #[must_use]
    pub const fn commit_queue_expiry_timeout(mut self, timeout: Duration) -> Self {
        self.commit_queue_expiry_timeout = timeout;
        self
    }

    /// Sets the snapshot entry-count threshold.
    #[must_use]
    pub const fn snapshot_batch_count(mut self, count: u64) -> Self {
        self.snapshot_batch_count = count;
        self
    }

    /// Sets the snapshot journal-size threshold.
    #[must_use]
    pub const fn snapshot_data_threshold_bytes(mut self, bytes: u64) -> Self {
        self.snapshot_data_threshold_bytes = bytes;
        self
    }

    /// Sets whether followers forward to the leader.
    #[must_use]
    pub const fn follower_forwarding(mut self, value: bool) -> Self {
        self.follower_forwarding = value;
        self
    }

    /// Sets the explicit replication quorum.
    #[must_use]
    pub const fn min_replication_count(mut self, count: usize) -> Self {
        self.min_replication_count = Some(count);
        self
    }

    /// Sets whether the journal syncs on every append.
    #[must_use]
    pub const fn sync_journal_on_append(mut self, value: bool) -> Self {
        self.sync_journal_on_append = value;
        self
    }

    /// Number of voters that must hold an entry for `voters` voting members.
    #[must_use]
    pub fn replication_quorum(&self, voters: usize) -> usize {
        self.min_replication_count
            .unwrap_or(voters / 2 + 1)
            .clamp(1, voters.max(1))
    }

    /// Minimum number of reachable followers a leader of `voters` voting
    /// members needs to stay out of the isolated state.
    #[must_use]
    pub fn min_isolated_leader_peer_count(&self, voters: usize) -> usize {
        self.replication_quorum(voters).saturating_sub(1)
    }

    /// Checks the configuration for values the partitions cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` describing the first offending field.
    pub fn validate(&self) -> DatastoreResult<()> {
        if self.commit_queue_capacity == 0 {
            return Err(DatastoreError::invalid_operation(
                "commit_queue_capacity must be at least 1",
            ));
        }
        if self.snapshot_batch_count == 0 {
            return Err(DatastoreError::invalid_operation(
                "snapshot_batch_count must be at least 1",
            ));
        }
        if self.journal_recovery_batch_size == 0 {
            return Err(DatastoreError::invalid_operation(
                "journal_recovery_batch_size must be at least 1",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DatastoreError::invalid_operation(
                "heartbeat_interval must be non-zero",
            ));
        }
        if self.isolated_leader_check_interval < self.heartbeat_interval {
            return Err(DatastoreError::invalid_operation(
                "isolated_leader_check_interval must not be shorter than heartbeat_interval",
            ));
        }
        Ok(())
    }
}
