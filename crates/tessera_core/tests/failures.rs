//! Rejections and timeouts: queue capacity, idle queue heads and shards
//! without a leader.

use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    ClientId, CommitPhase, Datastore, DatastoreConfig, DatastoreError, HistoryId, LocalCluster,
    MemberName, Modification, Node, ParticipatingShards, PartitionDirectory, PartitionSpec, Path,
    PrefixShardStrategy, ReadyOutcome, ShardName, TransactionHandle, TransactionId,
};

fn single_member(config: DatastoreConfig) -> (Arc<PartitionDirectory>, Datastore) {
    let member = MemberName::new("member-1");
    let cluster = Arc::new(LocalCluster::new());
    let directory = PartitionDirectory::in_cluster(member.clone(), config, &cluster).unwrap();
    directory
        .create_partition(ShardName::new("default"), PartitionSpec::in_memory(vec![member.clone()]))
        .unwrap();
    let datastore = Datastore::new(
        ClientId::new(member, 0),
        Arc::clone(&directory),
        Arc::new(PrefixShardStrategy::new(ShardName::new("default"))),
    );
    (directory, datastore)
}

async fn staged(datastore: &Datastore, path: &str) -> TransactionHandle {
    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse(path), Node::leaf("v")).await.unwrap();
    tx
}

#[tokio::test]
async fn full_commit_queue_rejects_the_newest_transaction() {
    let config = DatastoreConfig::for_testing().commit_queue_capacity(2);
    let (directory, datastore) = single_member(config);

    let mut queued = Vec::new();
    for path in ["/a", "/b"] {
        let mut tx = staged(&datastore, path).await;
        let coordinator = tx.ready().unwrap();
        assert!(matches!(
            coordinator.cohorts()[0].settled().await,
            ReadyOutcome::Ready(_)
        ));
        queued.push(coordinator);
    }

    let third = staged(&datastore, "/c").await;
    let err = datastore.commit(third).await.unwrap_err();
    match &err {
        DatastoreError::CohortPhaseFailure { phase, .. } => assert_eq!(*phase, CommitPhase::Ready),
        other => panic!("unexpected error {other}"),
    }
    assert!(matches!(
        err.root_cause(),
        DatastoreError::CommitQueueCapacityExceeded { capacity: 2, .. }
    ));
    assert!(err.is_retryable());

    // The queued transactions are unaffected and free the queue when done.
    for coordinator in queued {
        coordinator.submit().await.unwrap();
    }
    let retry = staged(&datastore, "/c").await;
    datastore.commit(retry).await.unwrap();
    directory.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_queue_head_expires_and_unblocks_successors() {
    let config = DatastoreConfig::for_testing().commit_queue_expiry_timeout(Duration::from_secs(1));
    let (directory, datastore) = single_member(config);

    let mut first = staged(&datastore, "/first").await;
    let mut stalled = first.ready().unwrap();
    assert!(matches!(
        stalled.cohorts()[0].settled().await,
        ReadyOutcome::Ready(_)
    ));

    // Queued behind a head that never asks to commit.
    let second = staged(&datastore, "/second").await;
    datastore.commit(second).await.unwrap();

    // The late request learns why its transaction is gone.
    let err = stalled.can_commit().await.unwrap_err();
    assert!(matches!(err.root_cause(), DatastoreError::Timeout { .. }));

    let tx = datastore.new_read_only_transaction();
    assert!(tx.read(&Path::parse("/second")).await.unwrap().is_some());
    assert!(tx.read(&Path::parse("/first")).await.unwrap().is_none());
    directory.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn held_transaction_commits_within_the_expiry_after_its_grant() {
    let config = DatastoreConfig::for_testing().commit_queue_expiry_timeout(Duration::from_secs(1));
    let (directory, datastore) = single_member(config);
    let shard = ShardName::new("default");
    let partition = directory.find_primary(&shard, true).await.unwrap();
    let shards = ParticipatingShards::new([shard.clone()]);
    let history = HistoryId::standalone(datastore.client().clone());
    let (first, second) = (
        TransactionId::new(history.clone(), 100),
        TransactionId::new(history, 101),
    );

    for (txid, path) in [(&first, "/first"), (&second, "/second")] {
        let write = vec![Modification::Write {
            path: Path::parse(path),
            data: Node::leaf("v"),
        }];
        partition
            .ready(txid.clone(), shards.clone(), write, Vec::new())
            .await
            .unwrap();
    }
    partition.can_commit(first.clone()).await.unwrap();
    let held = tokio::spawn({
        let partition = partition.clone();
        let second = second.clone();
        async move { partition.can_commit(second).await }
    });

    tokio::time::sleep(Duration::from_millis(850)).await;
    assert!(!held.is_finished());
    partition.commit(first).await.unwrap();
    held.await.unwrap().unwrap();

    // Idle time before the grant does not count against the commit.
    tokio::time::sleep(Duration::from_millis(300)).await;
    partition.commit(second).await.unwrap();
    assert_eq!(
        partition.read(Path::parse("/second")).await.unwrap(),
        Some(Node::leaf("v"))
    );
    directory.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shard_without_leader_fails_with_no_leader() {
    let cluster = Arc::new(LocalCluster::new());
    let config = DatastoreConfig::for_testing();
    let voters = vec![MemberName::new("member-1"), MemberName::new("member-2")];
    let mut directories = Vec::new();
    for voter in &voters {
        let directory = PartitionDirectory::in_cluster(voter.clone(), config.clone(), &cluster).unwrap();
        directory
            .create_partition(ShardName::new("default"), PartitionSpec::in_memory(voters.clone()))
            .unwrap();
        directories.push(directory);
    }

    let shard = ShardName::new("default");
    let err = directories[0].find_primary(&shard, true).await.unwrap_err();
    assert!(matches!(err, DatastoreError::NoLeader { .. }));

    let datastore = Datastore::new(
        ClientId::new(voters[0].clone(), 0),
        Arc::clone(&directories[0]),
        Arc::new(PrefixShardStrategy::new(shard.clone())),
    );
    let tx = staged(&datastore, "/x").await;
    let err = datastore.commit(tx).await.unwrap_err();
    assert!(matches!(err.root_cause(), DatastoreError::NoLeader { .. }));

    // Past the election timeout a replica fails requests straight away.
    let replica = directories[1].find_local(&shard, true).await.unwrap();
    let txid = TransactionId::new(HistoryId::standalone(ClientId::new(voters[1].clone(), 0)), 7);
    let started = tokio::time::Instant::now();
    let err = replica.can_commit(txid).await.unwrap_err();
    assert!(matches!(err, DatastoreError::NoLeader { .. }));
    assert!(started.elapsed() < config.leader_election_timeout);

    for directory in directories {
        directory.shutdown().await;
    }
}

#[test]
fn invalid_config_is_rejected_at_startup() {
    let cluster = Arc::new(LocalCluster::new());
    let config = DatastoreConfig::for_testing().commit_queue_capacity(0);
    assert!(PartitionDirectory::in_cluster(MemberName::new("member-1"), config, &cluster).is_err());
}
