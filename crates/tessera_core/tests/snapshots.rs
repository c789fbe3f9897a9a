//! Snapshot policy and restart recovery.

use std::path::Path as FsPath;
use std::sync::Arc;
use tessera_core::{
    ClientId, Datastore, DatastoreConfig, LocalCluster, MemberName, Node, PartitionDirectory,
    PartitionSpec, Path, PrefixShardStrategy, ShardName,
};
use tessera_storage::FileBackend;
use tempfile::TempDir;

fn member() -> MemberName {
    MemberName::new("member-1")
}

fn start(config: DatastoreConfig, spec: PartitionSpec) -> (Arc<PartitionDirectory>, Datastore) {
    let cluster = Arc::new(LocalCluster::new());
    let directory = PartitionDirectory::in_cluster(member(), config, &cluster).unwrap();
    directory.create_partition(ShardName::new("default"), spec).unwrap();
    let datastore = Datastore::new(
        ClientId::new(member(), 0),
        Arc::clone(&directory),
        Arc::new(PrefixShardStrategy::new(ShardName::new("default"))),
    );
    (directory, datastore)
}

fn file_spec(dir: &FsPath) -> PartitionSpec {
    PartitionSpec::new(
        vec![member()],
        Box::new(FileBackend::open(&dir.join("default.journal")).unwrap()),
        Box::new(FileBackend::open(&dir.join("default.snapshot")).unwrap()),
    )
}

async fn put(datastore: &Datastore, path: &str, value: &str) {
    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse(path), Node::leaf(value)).await.unwrap();
    datastore.commit(tx).await.unwrap();
}

async fn get(datastore: &Datastore, path: &str) -> Option<Node> {
    let tx = datastore.new_read_only_transaction();
    tx.read(&Path::parse(path)).await.unwrap()
}

#[tokio::test]
async fn root_overwrite_forces_a_snapshot() {
    let config = DatastoreConfig::for_testing().snapshot_batch_count(100);
    let (directory, datastore) = start(config, PartitionSpec::in_memory(vec![member()]));
    let leader = directory
        .find_primary(&ShardName::new("default"), true)
        .await
        .unwrap();

    let root = Node::container().with_child("network", Node::container());
    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::root(), root).await.unwrap();
    datastore.commit(tx).await.unwrap();

    let status = leader.status().await.unwrap();
    assert_eq!(status.snapshots_taken, 1);
    assert!(status.snapshot_index.as_u64() > 0);

    // Ordinary writes below the batch count do not snapshot.
    for i in 0..10 {
        put(&datastore, &format!("/network/n{i}"), "up").await;
    }
    let status = leader.status().await.unwrap();
    assert_eq!(status.snapshots_taken, 1);
    assert!(get(&datastore, "/network/n9").await.is_some());
    directory.shutdown().await;
}

#[tokio::test]
async fn entry_count_threshold_snapshots_and_trims_the_log() {
    let config = DatastoreConfig::for_testing().snapshot_batch_count(8);
    let (directory, datastore) = start(config, PartitionSpec::in_memory(vec![member()]));
    let leader = directory
        .find_primary(&ShardName::new("default"), true)
        .await
        .unwrap();

    for i in 0..10 {
        put(&datastore, &format!("/n{i}"), "v").await;
    }
    let status = leader.status().await.unwrap();
    assert!(status.snapshots_taken >= 1);
    assert!(status.log_entries < 8);
    assert_eq!(status.last_applied, status.commit_index);
    directory.shutdown().await;
}

#[tokio::test]
async fn restart_replays_the_journal() {
    let dir = TempDir::new().unwrap();
    let config = DatastoreConfig::for_testing();

    {
        let (directory, datastore) = start(config.clone(), file_spec(dir.path()));
        put(&datastore, "/a", "1").await;
        put(&datastore, "/b", "2").await;
        put(&datastore, "/a", "3").await;
        directory.shutdown().await;
    }

    let (directory, datastore) = start(config, file_spec(dir.path()));
    assert_eq!(get(&datastore, "/a").await, Some(Node::leaf("3")));
    assert_eq!(get(&datastore, "/b").await, Some(Node::leaf("2")));

    // The recovered partition keeps accepting commits.
    put(&datastore, "/c", "4").await;
    assert_eq!(get(&datastore, "/c").await, Some(Node::leaf("4")));
    directory.shutdown().await;
}

#[tokio::test]
async fn restart_loads_snapshot_then_later_entries() {
    let dir = TempDir::new().unwrap();
    let config = DatastoreConfig::for_testing();

    let snapshot_index = {
        let (directory, datastore) = start(config.clone(), file_spec(dir.path()));
        put(&datastore, "/before", "1").await;
        let leader = directory
            .find_primary(&ShardName::new("default"), true)
            .await
            .unwrap();
        let index = leader.snapshot_now().await.unwrap();
        put(&datastore, "/after", "2").await;
        directory.shutdown().await;
        index
    };

    let (directory, datastore) = start(config, file_spec(dir.path()));
    let leader = directory
        .find_primary(&ShardName::new("default"), true)
        .await
        .unwrap();
    let status = leader.status().await.unwrap();
    assert_eq!(status.snapshot_index, snapshot_index);
    assert!(status.last_applied > snapshot_index);
    assert_eq!(get(&datastore, "/before").await, Some(Node::leaf("1")));
    assert_eq!(get(&datastore, "/after").await, Some(Node::leaf("2")));
    directory.shutdown().await;
}

#[tokio::test]
async fn recovery_in_small_batches_matches_single_pass() {
    let dir = TempDir::new().unwrap();
    {
        let (directory, datastore) = start(DatastoreConfig::for_testing(), file_spec(dir.path()));
        for i in 0..20 {
            put(&datastore, &format!("/k{i}"), &i.to_string()).await;
        }
        directory.shutdown().await;
    }

    let mut config = DatastoreConfig::for_testing();
    config.journal_recovery_batch_size = 3;
    let (directory, datastore) = start(config, file_spec(dir.path()));
    for i in 0..20 {
        assert_eq!(
            get(&datastore, &format!("/k{i}")).await,
            Some(Node::leaf(i.to_string()))
        );
    }
    directory.shutdown().await;
}
