//! Caller-facing transactions and transaction chains.
//!
//! A [`TransactionHandle`] stages writes per shard while it is open.
//! [`ready`](TransactionHandle::ready) freezes the participating shards,
//! sends every shard its modifications and returns a
//! [`CohortCoordinator`](crate::CohortCoordinator) that runs the commit.
//!
//! A [`TransactionChain`] orders transactions of one client session: each
//! transaction sees the writes of its readied predecessors before they
//! commit, and only one transaction of a chain may be open at a time.

mod chain;
mod handle;
mod standalone;
mod state;

pub use chain::TransactionChain;
pub use handle::TransactionHandle;
pub use state::{TransactionKind, TransactionState};

pub(crate) use chain::ChainInner;
pub(crate) use standalone::StandaloneSequencer;
pub(crate) use state::TransactionShared;

use crate::config::DatastoreConfig;
use crate::datastore::ShardStrategy;
use crate::directory::PartitionDirectory;
use std::sync::Arc;

/// Collaborators every transaction of one datastore client uses.
pub(crate) struct TransactionContext {
    pub directory: Arc<PartitionDirectory>,
    pub strategy: Arc<dyn ShardStrategy>,
    pub config: DatastoreConfig,
}
