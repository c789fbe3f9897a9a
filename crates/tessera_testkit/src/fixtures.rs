//! Test fixtures and cluster helpers.
//!
//! A [`TestCluster`] runs every member of a cluster inside one process,
//! wired together through a shared [`LocalCluster`]. Leadership is handed
//! out explicitly with [`TestCluster::elect`].

use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{
    ClientId, Datastore, DatastoreConfig, DatastoreResult, LocalCluster, MemberName,
    PartitionDirectory, PartitionHandle, PartitionSpec, PrefixShardStrategy, ShardName,
    ShardStrategy, Term,
};
use tessera_storage::FileBackend;

/// Name of the shard that owns every path without a dedicated shard.
pub const DEFAULT_SHARD: &str = "default";

/// An in-process cluster of members sharing one [`LocalCluster`].
pub struct TestCluster {
    /// Shared membership and message delivery.
    pub cluster: Arc<LocalCluster>,
    directories: BTreeMap<MemberName, Arc<PartitionDirectory>>,
    config: DatastoreConfig,
}

impl TestCluster {
    /// Starts a directory for each named member.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn new(members: &[&str], config: DatastoreConfig) -> DatastoreResult<Self> {
        let cluster = Arc::new(LocalCluster::new());
        let mut directories = BTreeMap::new();
        for member in members {
            let member = MemberName::new(member);
            let directory = PartitionDirectory::in_cluster(member.clone(), config.clone(), &cluster)?;
            directories.insert(member, directory);
        }
        Ok(Self {
            cluster,
            directories,
            config,
        })
    }

    /// A one-member cluster hosting `shards`, each led by that member.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn single(shards: &[&str], config: DatastoreConfig) -> DatastoreResult<Self> {
        let cluster = Self::new(&["member-1"], config)?;
        for shard in shards {
            cluster.add_shard_on(shard, &["member-1"])?;
        }
        Ok(cluster)
    }

    /// Configuration every member runs with.
    #[must_use]
    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// Member names, sorted.
    #[must_use]
    pub fn members(&self) -> Vec<MemberName> {
        self.directories.keys().cloned().collect()
    }

    /// Directory of `member`.
    ///
    /// # Panics
    ///
    /// Panics if the member is not part of the cluster.
    #[must_use]
    pub fn directory(&self, member: &str) -> &Arc<PartitionDirectory> {
        self.directories
            .get(&MemberName::new(member))
            .unwrap_or_else(|| panic!("unknown member {member}"))
    }

    /// Hosts an in-memory replica of `shard` on every member.
    ///
    /// # Errors
    ///
    /// Fails if the shard already exists.
    pub fn add_shard(&self, shard: &str) -> DatastoreResult<()> {
        let members: Vec<String> = self.members().iter().map(ToString::to_string).collect();
        let members: Vec<&str> = members.iter().map(String::as_str).collect();
        self.add_shard_on(shard, &members)
    }

    /// Hosts an in-memory replica of `shard` on each of `voters`.
    ///
    /// # Errors
    ///
    /// Fails if the shard already exists on one of them.
    pub fn add_shard_on(&self, shard: &str, voters: &[&str]) -> DatastoreResult<()> {
        let names: Vec<MemberName> = voters.iter().map(MemberName::new).collect();
        for voter in voters {
            self.directory(voter)
                .create_partition(ShardName::new(shard), PartitionSpec::in_memory(names.clone()))?;
        }
        Ok(())
    }

    /// Makes `leader` lead `shard` for `term` and every other replica
    /// follow it.
    ///
    /// # Errors
    ///
    /// Fails if a replica is missing or refuses the term.
    pub async fn elect(&self, shard: &str, leader: &str, term: u64) -> DatastoreResult<()> {
        let shard = ShardName::new(shard);
        let leader = MemberName::new(leader);
        let term = Term::new(term);
        let replicas = self.replicas(&shard).await?;
        let followers: Vec<MemberName> = replicas
            .iter()
            .map(|h| h.member().clone())
            .filter(|m| m != &leader)
            .collect();

        for handle in &replicas {
            if handle.member() == &leader {
                handle.become_leader(term, followers.clone()).await?;
            }
        }
        for handle in &replicas {
            if handle.member() != &leader {
                handle.become_follower(term, Some(leader.clone())).await?;
            }
        }
        Ok(())
    }

    /// Every initialized replica of `shard`.
    ///
    /// # Errors
    ///
    /// Fails if a hosted replica does not finish recovery in time.
    pub async fn replicas(&self, shard: &ShardName) -> DatastoreResult<Vec<PartitionHandle>> {
        let mut handles = Vec::new();
        for directory in self.directories.values() {
            if directory.hosted_shards().contains(shard) {
                handles.push(directory.find_local(shard, true).await?);
            }
        }
        Ok(handles)
    }

    /// Replica of `shard` on `member`.
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if the member does not host it.
    pub async fn replica(&self, member: &str, shard: &str) -> DatastoreResult<PartitionHandle> {
        self.directory(member)
            .find_local(&ShardName::new(shard), true)
            .await
    }

    /// A client on `member` routing with `strategy`.
    #[must_use]
    pub fn datastore_with(&self, member: &str, strategy: Arc<dyn ShardStrategy>) -> Datastore {
        let directory = Arc::clone(self.directory(member));
        let client = ClientId::new(directory.member().clone(), 0);
        Datastore::new(client, directory, strategy)
    }

    /// A client on `member` routing by top-level segment: a segment naming
    /// a hosted shard goes there, anything else to [`DEFAULT_SHARD`].
    #[must_use]
    pub fn datastore(&self, member: &str) -> Datastore {
        let directory = self.directory(member);
        let strategy = directory
            .hosted_shards()
            .into_iter()
            .filter(|shard| shard.as_str() != DEFAULT_SHARD)
            .fold(
                PrefixShardStrategy::new(ShardName::new(DEFAULT_SHARD)),
                |strategy, shard| strategy.with_prefix(shard.as_str().to_owned(), shard),
            );
        self.datastore_with(member, Arc::new(strategy))
    }

    /// Cuts `member` off from every other member.
    pub fn isolate(&self, member: &str) {
        self.cluster.isolate(&MemberName::new(member));
    }

    /// Restores `member`'s connectivity.
    pub fn reconnect(&self, member: &str) {
        self.cluster.reconnect(&MemberName::new(member));
    }

    /// Stops every partition on every member.
    pub async fn shutdown(&self) {
        for directory in self.directories.values() {
            directory.shutdown().await;
        }
    }
}

/// Partition storage in files under a directory.
///
/// The journal and snapshot of `shard` live in `<dir>/<shard>.journal` and
/// `<dir>/<shard>.snapshot`, so reopening the same directory recovers the
/// partition.
///
/// # Errors
///
/// Fails if the files cannot be opened.
pub fn file_spec(
    dir: &FsPath,
    shard: &str,
    voters: Vec<MemberName>,
) -> DatastoreResult<PartitionSpec> {
    let journal = FileBackend::open_with_create_dirs(&dir.join(format!("{shard}.journal")))?;
    let snapshots = FileBackend::open_with_create_dirs(&dir.join(format!("{shard}.snapshot")))?;
    Ok(PartitionSpec::new(voters, Box::new(journal), Box::new(snapshots)))
}

/// A temporary directory for file-backed partitions.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
pub fn temp_storage_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}
