//! Cluster collaborators: membership and message delivery between replicas.
//!
//! Partitions never talk to each other directly. A leader ships log
//! entries through a [`ReplicationTransport`] and resolves the address of
//! another replica through a [`ClusterMembership`]. [`LocalCluster`]
//! implements both for members living in one process, with switches to
//! cut a member off the network in tests.

use crate::error::{DatastoreError, DatastoreResult};
use crate::partition::PartitionHandle;
use crate::replication::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::types::{MemberName, ShardName};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Delivers replication requests from a leader to one follower.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Sends an append request (or heartbeat) to `to`.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the follower cannot be contacted.
    async fn append_entries(
        &self,
        to: &MemberName,
        request: AppendEntriesRequest,
    ) -> DatastoreResult<AppendEntriesResponse>;

    /// Sends a snapshot to `to`.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the follower cannot be contacted.
    async fn install_snapshot(
        &self,
        to: &MemberName,
        request: InstallSnapshotRequest,
    ) -> DatastoreResult<InstallSnapshotResponse>;
}

/// Which replicas exist, where, and whether they can be reached.
pub trait ClusterMembership: Send + Sync {
    /// Publishes the replica of `handle.shard()` hosted on `handle.member()`.
    fn register(&self, handle: PartitionHandle);

    /// Removes the replica of `shard` hosted on `member`.
    fn deregister(&self, member: &MemberName, shard: &ShardName);

    /// Address of the replica of `shard` on `member`.
    fn resolve(&self, member: &MemberName, shard: &ShardName) -> Option<PartitionHandle>;

    /// Members hosting a replica of `shard`.
    fn replicas(&self, shard: &ShardName) -> Vec<MemberName>;

    /// Returns true if `from` can currently deliver messages to `to`.
    fn is_reachable(&self, from: &MemberName, to: &MemberName) -> bool;
}

/// In-process cluster: every member's replicas are registered in one map
/// and requests are delivered by calling the target handle.
#[derive(Debug, Default)]
pub struct LocalCluster {
    replicas: RwLock<BTreeMap<(ShardName, MemberName), PartitionHandle>>,
    isolated: RwLock<HashSet<MemberName>>,
}

impl LocalCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts `member` off from every other member.
    pub fn isolate(&self, member: &MemberName) {
        info!(%member, "member isolated");
        self.isolated.write().insert(member.clone());
    }

    /// Restores the connectivity of `member`.
    pub fn reconnect(&self, member: &MemberName) {
        info!(%member, "member reconnected");
        self.isolated.write().remove(member);
    }

    fn target(
        &self,
        from: &MemberName,
        to: &MemberName,
        shard: &ShardName,
    ) -> DatastoreResult<PartitionHandle> {
        if !self.is_reachable(from, to) {
            return Err(DatastoreError::Unreachable { member: to.clone() });
        }
        self.resolve(to, shard)
            .ok_or_else(|| DatastoreError::Unreachable { member: to.clone() })
    }
}

#[async_trait]
impl ReplicationTransport for LocalCluster {
    async fn append_entries(
        &self,
        to: &MemberName,
        request: AppendEntriesRequest,
    ) -> DatastoreResult<AppendEntriesResponse> {
        let target = self.target(&request.leader, to, &request.shard)?;
        target.append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        to: &MemberName,
        request: InstallSnapshotRequest,
    ) -> DatastoreResult<InstallSnapshotResponse> {
        let target = self.target(&request.leader, to, &request.snapshot.shard)?;
        target.install_snapshot(request).await
    }
}

impl ClusterMembership for LocalCluster {
    fn register(&self, handle: PartitionHandle) {
        debug!(shard = %handle.shard(), member = %handle.member(), "replica registered");
        self.replicas
            .write()
            .insert((handle.shard().clone(), handle.member().clone()), handle);
    }

    fn deregister(&self, member: &MemberName, shard: &ShardName) {
        self.replicas
            .write()
            .remove(&(shard.clone(), member.clone()));
    }

    fn resolve(&self, member: &MemberName, shard: &ShardName) -> Option<PartitionHandle> {
        self.replicas
            .read()
            .get(&(shard.clone(), member.clone()))
            .cloned()
    }

    fn replicas(&self, shard: &ShardName) -> Vec<MemberName> {
        self.replicas
            .read()
            .keys()
            .filter(|(s, _)| s == shard)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn is_reachable(&self, from: &MemberName, to: &MemberName) -> bool {
        if from == to {
            return true;
        }
        let isolated = self.isolated.read();
        !isolated.contains(from) && !isolated.contains(to)
    }
}
