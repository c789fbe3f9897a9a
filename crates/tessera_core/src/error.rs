//! Error types for the datastore.
//!
//! Every transaction operation resolves with either a value or exactly one
//! [`DatastoreError`]. Errors are `Clone` because one outcome (for example a
//! partition's readiness acknowledgement) is often observed by several
//! waiters.

use crate::types::{HistoryId, MemberName, ShardName, TransactionId};
use std::fmt;
use thiserror::Error;

/// Result type for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;

/// Phase of the three-phase commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitPhase {
    /// Readiness acknowledgement from a partition.
    Ready,
    /// canCommit vote.
    CanCommit,
    /// preCommit.
    PreCommit,
    /// commit.
    Commit,
    /// abort.
    Abort,
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::CanCommit => "canCommit",
            Self::PreCommit => "preCommit",
            Self::Commit => "commit",
            Self::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in datastore operations.
#[derive(Debug, Clone, Error)]
pub enum DatastoreError {
    /// The partition has no elected leader.
    #[error("shard {shard} has no leader")]
    NoLeader {
        /// Partition name.
        shard: ShardName,
    },

    /// The replica contacted is a follower and forwarding is disabled.
    #[error("shard {shard} replica on {member} is not the leader (known leader: {leader:?})")]
    NotLeader {
        /// Partition name.
        shard: ShardName,
        /// Member hosting the contacted replica.
        member: MemberName,
        /// Leader known to that replica, if any.
        leader: Option<MemberName>,
    },

    /// The leader cannot reach a replication quorum.
    #[error("shard {shard} leader on {member} is isolated from its followers")]
    IsolatedLeader {
        /// Partition name.
        shard: ShardName,
        /// Member hosting the isolated leader.
        member: MemberName,
    },

    /// The partition exists but has not finished startup or recovery.
    #[error("shard {shard} is not initialized yet")]
    NotInitialized {
        /// Partition name.
        shard: ShardName,
    },

    /// No member hosts a partition with this name.
    #[error("shard {shard} not found")]
    ShardNotFound {
        /// Partition name.
        shard: ShardName,
    },

    /// The commit queue is full; the newest transaction is rejected.
    #[error(
        "could not enqueue transaction {txid} on shard {shard} - the maximum commit queue capacity {capacity} has been reached"
    )]
    CommitQueueCapacityExceeded {
        /// Partition name.
        shard: ShardName,
        /// Rejected transaction.
        txid: TransactionId,
        /// Configured capacity.
        capacity: usize,
    },

    /// A 3PC phase failed on one participant.
    #[error("{phase} failed for transaction {txid} on shard {shard}: {cause}")]
    CohortPhaseFailure {
        /// Phase that failed.
        phase: CommitPhase,
        /// Transaction.
        txid: TransactionId,
        /// Participant that failed.
        shard: ShardName,
        /// Original cause.
        cause: Box<DatastoreError>,
    },

    /// Illegal operation on a transaction chain.
    #[error("transaction chain {history}: {message}")]
    ChainState {
        /// Chain history.
        history: HistoryId,
        /// Description of the violation.
        message: String,
    },

    /// Staging operation on a transaction that has already been readied.
    #[error("transaction {txid} has already been readied")]
    AlreadyReadied {
        /// Transaction.
        txid: TransactionId,
    },

    /// Operation on a committed, aborted or closed transaction.
    #[error("transaction {txid} is closed")]
    TransactionClosed {
        /// Transaction.
        txid: TransactionId,
    },

    /// Hole or regression detected in frontend purge bookkeeping.
    #[error("purge invariant violated for history {history}: {message}")]
    PurgeInvariantViolation {
        /// Affected history.
        history: HistoryId,
        /// Description of the violation.
        message: String,
    },

    /// A suspended wait expired.
    #[error("timeout: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },

    /// Modifications failed structural or validator checks.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the failure.
        message: String,
    },

    /// The partition has no record of the transaction.
    #[error("no cohort entry found for transaction {txid} on shard {shard}")]
    UnknownTransaction {
        /// Partition name.
        shard: ShardName,
        /// Transaction.
        txid: TransactionId,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The partition's task has stopped.
    #[error("shard {shard} on {member} has stopped")]
    PartitionStopped {
        /// Partition name.
        shard: ShardName,
        /// Member hosting it.
        member: MemberName,
    },

    /// A peer could not be reached.
    #[error("member {member} is unreachable")]
    Unreachable {
        /// Target member.
        member: MemberName,
    },

    /// The journal or snapshot store is damaged.
    #[error("journal corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in a framed record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Storage backend error.
    #[error("storage error: {message}")]
    Storage {
        /// Backend message.
        message: String,
    },

    /// CBOR encoding or decoding error.
    #[error("codec error: {message}")]
    Codec {
        /// Codec message.
        message: String,
    },
}

impl DatastoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a chain state error.
    pub fn chain_state(history: HistoryId, message: impl Into<String>) -> Self {
        Self::ChainState {
            history,
            message: message.into(),
        }
    }

    /// Creates a purge invariant violation.
    pub fn purge_violation(history: HistoryId, message: impl Into<String>) -> Self {
        Self::PurgeInvariantViolation {
            history,
            message: message.into(),
        }
    }

    /// Wraps `cause` as the failure of one participant in one phase.
    ///
    /// An error that already is a phase failure is returned unchanged so the
    /// innermost cause stays visible.
    pub fn phase_failure(
        phase: CommitPhase,
        txid: TransactionId,
        shard: ShardName,
        cause: DatastoreError,
    ) -> Self {
        match cause {
            already @ Self::CohortPhaseFailure { .. } => already,
            cause => Self::CohortPhaseFailure {
                phase,
                txid,
                shard,
                cause: Box::new(cause),
            },
        }
    }

    /// Returns the innermost cause of a phase failure, or `self`.
    #[must_use]
    pub fn root_cause(&self) -> &DatastoreError {
        match self {
            Self::CohortPhaseFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns true if the caller may retry the whole transaction later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::NoLeader { .. }
                | Self::NotLeader { .. }
                | Self::IsolatedLeader { .. }
                | Self::NotInitialized { .. }
                | Self::CommitQueueCapacityExceeded { .. }
                | Self::Timeout { .. }
                | Self::Unreachable { .. }
        )
    }
}

impl From<tessera_storage::StorageError> for DatastoreError {
    fn from(err: tessera_storage::StorageError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for DatastoreError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for DatastoreError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}
