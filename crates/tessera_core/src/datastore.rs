//! Client entry point: shard routing and transaction factories.

use crate::directory::PartitionDirectory;
use crate::error::{DatastoreError, DatastoreResult};
use crate::partition::CommitValidator;
use crate::transaction::{
    StandaloneSequencer, TransactionChain, TransactionContext, TransactionHandle, TransactionKind,
    TransactionShared,
};
use crate::tree::Path;
use crate::types::{ClientId, HistoryId, ShardName, TransactionId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Maps a tree path to the shard that owns it.
pub trait ShardStrategy: Send + Sync {
    /// Shard owning `path`.
    fn shard_for(&self, path: &Path) -> ShardName;
}

/// Routes by the first path segment, falling back to a default shard.
#[derive(Debug, Clone)]
pub struct PrefixShardStrategy {
    default: ShardName,
    prefixes: BTreeMap<String, ShardName>,
}

impl PrefixShardStrategy {
    /// Routes everything to `default`.
    #[must_use]
    pub fn new(default: ShardName) -> Self {
        Self {
            default,
            prefixes: BTreeMap::new(),
        }
    }

    /// Routes paths whose first segment is `segment` to `shard`.
    #[must_use]
    pub fn with_prefix(mut self, segment: impl Into<String>, shard: ShardName) -> Self {
        self.prefixes.insert(segment.into(), shard);
        self
    }
}

impl ShardStrategy for PrefixShardStrategy {
    fn shard_for(&self, path: &Path) -> ShardName {
        path.first()
            .and_then(|segment| self.prefixes.get(segment))
            .unwrap_or(&self.default)
            .clone()
    }
}

/// One client's view of the distributed datastore.
///
/// Standalone transactions share history `0` of the client; each chain gets
/// its own history starting at `1`.
pub struct Datastore {
    client: ClientId,
    context: Arc<TransactionContext>,
    standalone: Arc<StandaloneSequencer>,
    next_history: AtomicU64,
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Datastore {
    /// Creates a client on top of `directory`.
    pub fn new(
        client: ClientId,
        directory: Arc<PartitionDirectory>,
        strategy: Arc<dyn ShardStrategy>,
    ) -> Self {
        let config = directory.config().clone();
        info!(%client, member = %directory.member(), "datastore client started");
        Self {
            client,
            context: Arc::new(TransactionContext {
                directory,
                strategy,
                config,
            }),
            standalone: Arc::new(StandaloneSequencer::new()),
            next_history: AtomicU64::new(1),
        }
    }

    /// Client identity.
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Directory this client routes through.
    #[must_use]
    pub fn directory(&self) -> &Arc<PartitionDirectory> {
        &self.context.directory
    }

    /// Shard owning `path`.
    #[must_use]
    pub fn shard_for(&self, path: &Path) -> ShardName {
        self.context.strategy.shard_for(path)
    }

    fn standalone(&self, kind: TransactionKind) -> TransactionHandle {
        let seq = self.standalone.open();
        let txid = TransactionId::new(HistoryId::standalone(self.client.clone()), seq);
        debug!(%txid, %kind, "transaction opened");
        TransactionHandle::new(
            Arc::new(TransactionShared::standalone(
                txid,
                Arc::clone(&self.standalone),
            )),
            kind,
            Arc::clone(&self.context),
        )
    }

    /// Opens a standalone read-only transaction.
    #[must_use]
    pub fn new_read_only_transaction(&self) -> TransactionHandle {
        self.standalone(TransactionKind::ReadOnly)
    }

    /// Opens a standalone write-only transaction.
    #[must_use]
    pub fn new_write_only_transaction(&self) -> TransactionHandle {
        self.standalone(TransactionKind::WriteOnly)
    }

    /// Opens a standalone read-write transaction.
    #[must_use]
    pub fn new_read_write_transaction(&self) -> TransactionHandle {
        self.standalone(TransactionKind::ReadWrite)
    }

    /// Creates a chain with a fresh history.
    #[must_use]
    pub fn create_transaction_chain(&self) -> TransactionChain {
        let history = HistoryId::new(
            self.client.clone(),
            self.next_history.fetch_add(1, Ordering::Relaxed),
        );
        debug!(%history, "transaction chain created");
        TransactionChain::new(history, Arc::clone(&self.context))
    }

    /// Registers `validator` on every replica of `shard`.
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if no replica is known, or the first replica that
    /// refused.
    pub async fn register_validator(
        &self,
        shard: &ShardName,
        validator: Arc<dyn CommitValidator>,
    ) -> DatastoreResult<()> {
        let membership = self.context.directory.membership();
        let replicas = membership.replicas(shard);
        if replicas.is_empty() {
            return Err(DatastoreError::ShardNotFound {
                shard: shard.clone(),
            });
        }
        for member in replicas {
            if let Some(handle) = membership.resolve(&member, shard) {
                handle.register_validator(Arc::clone(&validator)).await?;
            }
        }
        Ok(())
    }

    /// Readies and commits `transaction`.
    ///
    /// # Errors
    ///
    /// Any error from [`TransactionHandle::ready`] or the commit protocol.
    pub async fn commit(&self, mut transaction: TransactionHandle) -> DatastoreResult<()> {
        transaction.ready()?.submit().await
    }
}
