//! Registry of the partitions a member hosts, and leader lookup.
//!
//! A [`PartitionDirectory`] is built once per member and passed to whatever
//! needs to reach a partition. It starts partition tasks, publishes them to
//! the cluster membership, and answers two questions:
//!
//! - [`find_local`](PartitionDirectory::find_local): the replica of a shard
//!   hosted on this member.
//! - [`find_primary`](PartitionDirectory::find_primary): the replica that
//!   currently leads a shard, wherever it is hosted.
//!
//! Both can wait for a replica that is still recovering. "Does not exist"
//! (`ShardNotFound`) is always reported separately from "not there yet"
//! (`NotInitialized`, `NoLeader`), so callers know whether a retry can help.

use crate::cluster::{ClusterMembership, LocalCluster, ReplicationTransport};
use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, DatastoreResult};
use crate::partition::{self, PartitionHandle, PartitionSpec};
use crate::types::{MemberName, ShardName};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct HostedPartition {
    handle: PartitionHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Partitions hosted by one member.
pub struct PartitionDirectory {
    member: MemberName,
    config: DatastoreConfig,
    transport: Arc<dyn ReplicationTransport>,
    membership: Arc<dyn ClusterMembership>,
    partitions: RwLock<BTreeMap<ShardName, Arc<HostedPartition>>>,
}

impl fmt::Debug for PartitionDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionDirectory")
            .field("member", &self.member)
            .field("shards", &self.hosted_shards())
            .finish_non_exhaustive()
    }
}

impl PartitionDirectory {
    /// Creates the directory of `member`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `config` does not validate.
    pub fn start(
        member: MemberName,
        config: DatastoreConfig,
        transport: Arc<dyn ReplicationTransport>,
        membership: Arc<dyn ClusterMembership>,
    ) -> DatastoreResult<Arc<Self>> {
        config.validate()?;
        info!(%member, "partition directory started");
        Ok(Arc::new(Self {
            member,
            config,
            transport,
            membership,
            partitions: RwLock::new(BTreeMap::new()),
        }))
    }

    /// Creates the directory of `member` in an in-process cluster.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `config` does not validate.
    pub fn in_cluster(
        member: MemberName,
        config: DatastoreConfig,
        cluster: &Arc<LocalCluster>,
    ) -> DatastoreResult<Arc<Self>> {
        Self::start(member, config, cluster.clone(), cluster.clone())
    }

    /// Member this directory belongs to.
    #[must_use]
    pub fn member(&self) -> &MemberName {
        &self.member
    }

    /// Configuration shared by the hosted partitions.
    #[must_use]
    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// Cluster membership the directory resolves remote replicas through.
    #[must_use]
    pub fn membership(&self) -> &Arc<dyn ClusterMembership> {
        &self.membership
    }

    /// Names of the locally hosted shards.
    #[must_use]
    pub fn hosted_shards(&self) -> Vec<ShardName> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Starts a local replica of `shard`.
    ///
    /// The replica recovers from the storage in `spec` before it reports
    /// itself initialized.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the shard is already hosted here or
    /// this member is not one of `spec`'s voters.
    pub fn create_partition(
        &self,
        shard: ShardName,
        spec: PartitionSpec,
    ) -> DatastoreResult<PartitionHandle> {
        if !spec.voters().contains(&self.member) {
            return Err(DatastoreError::invalid_operation(format!(
                "member {} is not a voter of shard {shard}",
                self.member
            )));
        }
        let mut partitions = self.partitions.write();
        if partitions.contains_key(&shard) {
            return Err(DatastoreError::invalid_operation(format!(
                "shard {shard} is already hosted on {}",
                self.member
            )));
        }

        let (handle, task) = partition::spawn(
            shard.clone(),
            self.member.clone(),
            spec,
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.membership),
        );
        self.membership.register(handle.clone());
        partitions.insert(
            shard.clone(),
            Arc::new(HostedPartition {
                handle: handle.clone(),
                task: Mutex::new(Some(task)),
            }),
        );
        debug!(%shard, member = %self.member, "partition created");
        Ok(handle)
    }

    /// Returns the local replica of `shard`.
    ///
    /// With `wait`, a replica that is still recovering is waited for up to
    /// the shard initialization timeout.
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if this member does not host the shard,
    /// `NotInitialized` if it has not finished recovery.
    pub async fn find_local(&self, shard: &ShardName, wait: bool) -> DatastoreResult<PartitionHandle> {
        let handle = self.local(shard).ok_or_else(|| DatastoreError::ShardNotFound {
            shard: shard.clone(),
        })?;
        if handle.shard_status().initialized {
            return Ok(handle);
        }
        if !wait {
            return Err(DatastoreError::NotInitialized {
                shard: shard.clone(),
            });
        }

        let mut status = handle.subscribe();
        let waited = tokio::time::timeout(
            self.config.shard_initialization_timeout,
            status.wait_for(|s| s.initialized),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(handle),
            Ok(Err(_)) => Err(DatastoreError::PartitionStopped {
                shard: shard.clone(),
                member: self.member.clone(),
            }),
            Err(_) => Err(DatastoreError::NotInitialized {
                shard: shard.clone(),
            }),
        }
    }

    /// Returns the replica currently leading `shard`, local or remote.
    ///
    /// An isolated leader is still returned, so the caller sees its
    /// `IsolatedLeader` rejection. With `wait`, lookup retries until a
    /// leader appears or the shard initialization timeout passes.
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if no member hosts the shard, `NotInitialized` if no
    /// reachable replica finished recovery, `NoLeader` otherwise.
    pub async fn find_primary(&self, shard: &ShardName, wait: bool) -> DatastoreResult<PartitionHandle> {
        let deadline = Instant::now() + self.config.shard_initialization_timeout;
        loop {
            match self.lookup_primary(shard) {
                Ok(handle) => return Ok(handle),
                Err(e @ DatastoreError::ShardNotFound { .. }) => return Err(e),
                Err(e) if !wait || Instant::now() >= deadline => {
                    debug!(%shard, member = %self.member, error = %e, "primary lookup failed");
                    return Err(e);
                }
                Err(_) => {
                    tokio::time::sleep(self.config.heartbeat_interval).await;
                }
            }
        }
    }

    fn lookup_primary(&self, shard: &ShardName) -> DatastoreResult<PartitionHandle> {
        let replicas = self.replica_handles(shard);
        if replicas.is_empty() {
            return Err(DatastoreError::ShardNotFound {
                shard: shard.clone(),
            });
        }

        let mut initialized = false;
        for handle in &replicas {
            if !self.membership.is_reachable(&self.member, handle.member()) {
                continue;
            }
            let status = handle.shard_status();
            if !status.initialized {
                continue;
            }
            initialized = true;
            if status.role.is_leader() {
                return Ok(handle.clone());
            }
            if let Some(leader) = &status.leader {
                if let Some(found) = replicas.iter().find(|h| h.member() == leader) {
                    let leader_status = found.shard_status();
                    if leader_status.initialized
                        && leader_status.role.is_leader()
                        && self.membership.is_reachable(&self.member, leader)
                    {
                        return Ok(found.clone());
                    }
                }
            }
        }

        if initialized {
            Err(DatastoreError::NoLeader {
                shard: shard.clone(),
            })
        } else {
            Err(DatastoreError::NotInitialized {
                shard: shard.clone(),
            })
        }
    }

    /// Local replica first, then every other registered replica.
    fn replica_handles(&self, shard: &ShardName) -> Vec<PartitionHandle> {
        let mut handles: Vec<PartitionHandle> = self.local(shard).into_iter().collect();
        for member in self.membership.replicas(shard) {
            if member == self.member {
                continue;
            }
            if let Some(handle) = self.membership.resolve(&member, shard) {
                handles.push(handle);
            }
        }
        handles
    }

    fn local(&self, shard: &ShardName) -> Option<PartitionHandle> {
        self.partitions
            .read()
            .get(shard)
            .map(|hosted| hosted.handle.clone())
    }

    /// Stops every hosted partition and waits for its task to finish.
    pub async fn shutdown(&self) {
        let hosted: Vec<(ShardName, Arc<HostedPartition>)> =
            std::mem::take(&mut *self.partitions.write()).into_iter().collect();
        for (shard, partition) in hosted {
            self.membership.deregister(&self.member, &shard);
            if let Err(e) = partition.handle.shutdown().await {
                warn!(%shard, member = %self.member, error = %e, "partition did not acknowledge shutdown");
            }
            let task = partition.task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(%shard, member = %self.member, error = %e, "partition task ended abnormally");
                }
            }
        }
        info!(member = %self.member, "partition directory stopped");
    }
}
