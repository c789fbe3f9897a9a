//! # Tessera Core
//!
//! A replicated, partitioned transactional data layer.
//!
//! The data tree is split into shards. Each shard is a partition replicated
//! across a set of members, one of which leads. Clients open transactions
//! through a [`Datastore`], stage writes locally and commit them across
//! every shard they touched with a three-phase commit:
//!
//! 1. `ready` sends each shard its modifications and queues the
//!    transaction in the leader's [`CommitQueue`](commit_queue::CommitQueue)
//! 2. `can_commit` asks each shard, in a fixed shard order, whether the
//!    transaction is next in line and passes validation
//! 3. `commit` replicates the transaction to a quorum and applies it
//!
//! Transactions of a [`TransactionChain`] see each other's writes before
//! they commit and commit in order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::{
//!     ClientId, Datastore, DatastoreConfig, LocalCluster, MemberName, Node,
//!     PartitionDirectory, PartitionSpec, Path, PrefixShardStrategy, ShardName,
//! };
//!
//! # async fn run() -> tessera_core::DatastoreResult<()> {
//! let member = MemberName::new("member-1");
//! let cluster = Arc::new(LocalCluster::new());
//! let directory = PartitionDirectory::in_cluster(member.clone(), DatastoreConfig::default(), &cluster)?;
//! directory.create_partition(ShardName::new("default"), PartitionSpec::in_memory(vec![member.clone()]))?;
//!
//! let strategy = Arc::new(PrefixShardStrategy::new(ShardName::new("default")));
//! let datastore = Datastore::new(ClientId::new(member, 0), directory, strategy);
//!
//! let mut tx = datastore.new_read_write_transaction();
//! tx.write(Path::parse("/cars/sedan"), Node::leaf("blue")).await?;
//! datastore.commit(tx).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cluster;
mod cohort;
pub mod commit_queue;
mod config;
mod coordinator;
mod datastore;
mod directory;
mod error;
pub mod frontend;
pub mod journal;
pub mod partition;
pub mod replication;
pub mod snapshot;
mod transaction;
pub mod tree;
mod types;

pub use cluster::{ClusterMembership, LocalCluster, ReplicationTransport};
pub use cohort::{CommitCohort, ReadyOutcome};
pub use config::DatastoreConfig;
pub use coordinator::{CohortCoordinator, CoordinatorPhase};
pub use datastore::{Datastore, PrefixShardStrategy, ShardStrategy};
pub use directory::PartitionDirectory;
pub use error::{CommitPhase, DatastoreError, DatastoreResult};
pub use partition::{
    CommitValidator, PartitionHandle, PartitionSpec, PartitionStatus, ShardRole, ShardStatus,
};
pub use transaction::{TransactionChain, TransactionHandle, TransactionKind, TransactionState};
pub use tree::{Modification, Node, Path};
pub use types::{
    ClientId, HistoryId, LogIndex, MemberName, ParticipatingShards, ShardName, Term,
    TransactionId,
};
