//! Transaction and chain behaviour against in-process partitions.

use std::sync::Arc;
use tessera_core::{
    ClientId, CommitValidator, CoordinatorPhase, Datastore, DatastoreConfig, DatastoreError,
    DatastoreResult, LocalCluster, MemberName, Modification, Node, PartitionDirectory,
    PartitionSpec, Path, PrefixShardStrategy, ShardName, TransactionId, TransactionState,
};
use tessera_core::tree::TreeSnapshot;

const MEMBER: &str = "member-1";

/// One member leading every shard in `shards`. The first shard is the
/// default; the others own the paths under their own name.
fn single_member(shards: &[&str]) -> (Arc<PartitionDirectory>, Datastore) {
    single_member_with(shards, DatastoreConfig::for_testing())
}

fn single_member_with(shards: &[&str], config: DatastoreConfig) -> (Arc<PartitionDirectory>, Datastore) {
    let member = MemberName::new(MEMBER);
    let cluster = Arc::new(LocalCluster::new());
    let directory = PartitionDirectory::in_cluster(member.clone(), config, &cluster).unwrap();
    let mut strategy = PrefixShardStrategy::new(ShardName::new(shards[0]));
    for shard in shards {
        directory
            .create_partition(ShardName::new(shard), PartitionSpec::in_memory(vec![member.clone()]))
            .unwrap();
        strategy = strategy.with_prefix(*shard, ShardName::new(shard));
    }
    let datastore = Datastore::new(ClientId::new(member, 0), Arc::clone(&directory), Arc::new(strategy));
    (directory, datastore)
}

fn leaf(value: &str) -> Node {
    Node::leaf(value)
}

#[tokio::test]
async fn single_shard_write_is_visible_after_commit() {
    let (directory, datastore) = single_member(&["default"]);
    let cars = Node::container().with_child("sedan", leaf("blue"));

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/cars"), cars.clone()).await.unwrap();
    let mut coordinator = tx.ready().unwrap();
    assert_eq!(tx.state(), TransactionState::Readied);

    coordinator.can_commit().await.unwrap();
    coordinator.pre_commit().await.unwrap();
    coordinator.commit().await.unwrap();
    assert_eq!(coordinator.phase(), CoordinatorPhase::Committed);
    assert_eq!(tx.state(), TransactionState::Committed);

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&Path::parse("/cars")).await.unwrap(), Some(cars));
    assert!(reader.exists(&Path::parse("/cars/sedan")).await.unwrap());
    directory.shutdown().await;
}

#[tokio::test]
async fn cross_shard_commit_applies_everywhere() {
    let (directory, datastore) = single_member(&["default", "cars", "people"]);

    let mut tx = datastore.new_read_write_transaction();
    tx.write(Path::parse("/people/alice"), leaf("1")).await.unwrap();
    tx.write(Path::parse("/cars/sedan"), leaf("2")).await.unwrap();
    tx.merge(Path::parse("/misc"), Node::container().with_child("x", leaf("3")))
        .await
        .unwrap();

    let coordinator = tx.ready().unwrap();
    let shards: Vec<&str> = coordinator.shards().as_slice().iter().map(ShardName::as_str).collect();
    assert_eq!(shards, ["cars", "default", "people"]);
    coordinator.submit().await.unwrap();

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&Path::parse("/people/alice")).await.unwrap(), Some(leaf("1")));
    assert_eq!(reader.read(&Path::parse("/cars/sedan")).await.unwrap(), Some(leaf("2")));
    assert_eq!(reader.read(&Path::parse("/misc/x")).await.unwrap(), Some(leaf("3")));
    directory.shutdown().await;
}

#[tokio::test]
async fn reads_see_own_staged_writes() {
    let (directory, datastore) = single_member(&["default"]);
    let mut setup = datastore.new_write_only_transaction();
    setup.write(Path::parse("/a/x"), leaf("old")).await.unwrap();
    setup.write(Path::parse("/a/y"), leaf("kept")).await.unwrap();
    datastore.commit(setup).await.unwrap();

    let mut tx = datastore.new_read_write_transaction();
    tx.write(Path::parse("/a/x"), leaf("new")).await.unwrap();
    tx.delete(Path::parse("/a/y")).await.unwrap();
    assert_eq!(tx.read(&Path::parse("/a/x")).await.unwrap(), Some(leaf("new")));
    assert!(!tx.exists(&Path::parse("/a/y")).await.unwrap());

    // Nothing leaks to other transactions before commit.
    let other = datastore.new_read_only_transaction();
    assert_eq!(other.read(&Path::parse("/a/x")).await.unwrap(), Some(leaf("old")));
    directory.shutdown().await;
}

#[tokio::test]
async fn lifecycle_errors() {
    let (directory, datastore) = single_member(&["default"]);

    let mut read_only = datastore.new_read_only_transaction();
    assert!(matches!(
        read_only.write(Path::parse("/a"), leaf("1")).await,
        Err(DatastoreError::InvalidOperation { .. })
    ));
    assert!(matches!(read_only.ready(), Err(DatastoreError::InvalidOperation { .. })));
    read_only.cancel().unwrap();
    assert!(matches!(
        read_only.read(&Path::parse("/a")).await,
        Err(DatastoreError::TransactionClosed { .. })
    ));

    let write_only = datastore.new_write_only_transaction();
    assert!(matches!(
        write_only.read(&Path::parse("/a")).await,
        Err(DatastoreError::InvalidOperation { .. })
    ));

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/a"), leaf("1")).await.unwrap();
    let coordinator = tx.ready().unwrap();
    assert!(matches!(
        tx.write(Path::parse("/b"), leaf("2")).await,
        Err(DatastoreError::AlreadyReadied { .. })
    ));
    assert!(matches!(tx.ready(), Err(DatastoreError::AlreadyReadied { .. })));

    coordinator.submit().await.unwrap();
    assert!(matches!(
        tx.delete(Path::parse("/a")).await,
        Err(DatastoreError::TransactionClosed { .. })
    ));
    directory.shutdown().await;
}

#[tokio::test]
async fn empty_transaction_commits_trivially() {
    let (directory, datastore) = single_member(&["default"]);
    let mut tx = datastore.new_write_only_transaction();
    let mut coordinator = tx.ready().unwrap();
    assert!(coordinator.cohorts().is_empty());
    coordinator.can_commit().await.unwrap();
    coordinator.pre_commit().await.unwrap();
    coordinator.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    directory.shutdown().await;
}

#[tokio::test]
async fn phases_out_of_order_are_rejected() {
    let (directory, datastore) = single_member(&["default"]);
    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/a"), leaf("1")).await.unwrap();
    let mut coordinator = tx.ready().unwrap();

    assert!(matches!(coordinator.commit().await, Err(DatastoreError::InvalidOperation { .. })));
    coordinator.can_commit().await.unwrap();
    coordinator.pre_commit().await.unwrap();
    coordinator.commit().await.unwrap();
    assert!(matches!(coordinator.abort().await, Err(DatastoreError::InvalidOperation { .. })));
    directory.shutdown().await;
}

#[tokio::test]
async fn abort_discards_writes_and_frees_the_queue() {
    let (directory, datastore) = single_member(&["default"]);

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/a"), leaf("aborted")).await.unwrap();
    let mut coordinator = tx.ready().unwrap();
    coordinator.can_commit().await.unwrap();
    coordinator.abort().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Aborted);
    // Aborting twice is harmless.
    coordinator.abort().await.unwrap();

    let mut next = datastore.new_write_only_transaction();
    next.write(Path::parse("/b"), leaf("committed")).await.unwrap();
    datastore.commit(next).await.unwrap();

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&Path::parse("/a")).await.unwrap(), None);
    assert_eq!(reader.read(&Path::parse("/b")).await.unwrap(), Some(leaf("committed")));
    directory.shutdown().await;
}

struct ForbidValue {
    subtree: Path,
    forbidden: Node,
}

impl CommitValidator for ForbidValue {
    fn subtree(&self) -> &Path {
        &self.subtree
    }

    fn validate(
        &self,
        txid: &TransactionId,
        _modifications: &[Modification],
        candidate: &TreeSnapshot,
    ) -> DatastoreResult<()> {
        if candidate.read(&self.subtree).as_ref() == Some(&self.forbidden) {
            return Err(DatastoreError::validation(format!("{txid} writes a forbidden value")));
        }
        Ok(())
    }
}

#[tokio::test]
async fn validator_veto_fails_can_commit_and_aborts() {
    let (directory, datastore) = single_member(&["default", "cars"]);
    datastore
        .register_validator(
            &ShardName::new("cars"),
            Arc::new(ForbidValue {
                subtree: Path::parse("/cars/sedan"),
                forbidden: leaf("red"),
            }),
        )
        .await
        .unwrap();

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/misc"), leaf("1")).await.unwrap();
    tx.write(Path::parse("/cars/sedan"), leaf("red")).await.unwrap();
    let err = datastore.commit(tx).await.unwrap_err();
    match &err {
        DatastoreError::CohortPhaseFailure { shard, .. } => assert_eq!(shard.as_str(), "cars"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), DatastoreError::Validation { .. }));

    // The default shard was aborted too, so its queue is free again.
    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/misc"), leaf("2")).await.unwrap();
    tx.write(Path::parse("/cars/sedan"), leaf("blue")).await.unwrap();
    datastore.commit(tx).await.unwrap();

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&Path::parse("/misc")).await.unwrap(), Some(leaf("2")));
    directory.shutdown().await;
}

#[tokio::test]
async fn invalid_modification_fails_at_can_commit() {
    let (directory, datastore) = single_member(&["default"]);
    let mut setup = datastore.new_write_only_transaction();
    setup.write(Path::parse("/a"), leaf("value")).await.unwrap();
    datastore.commit(setup).await.unwrap();

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/a/child"), leaf("beneath a leaf")).await.unwrap();
    let err = datastore.commit(tx).await.unwrap_err();
    assert!(matches!(err.root_cause(), DatastoreError::Validation { .. }));
    directory.shutdown().await;
}

#[tokio::test]
async fn chain_reads_readied_predecessor() {
    let (directory, datastore) = single_member(&["default"]);
    let chain = datastore.create_transaction_chain();
    let x = Path::parse("/x");

    let mut tx1 = chain.new_write_only_transaction().unwrap();
    tx1.write(x.clone(), leaf("from tx1")).await.unwrap();
    let tx1_commit = tx1.ready().unwrap();

    let mut tx2 = chain.new_read_write_transaction().unwrap();
    assert_eq!(tx2.read(&x).await.unwrap(), Some(leaf("from tx1")));

    let err = chain.new_read_write_transaction().unwrap_err();
    assert!(matches!(err, DatastoreError::ChainState { .. }));

    // Outside the chain the write is not visible yet.
    let outsider = datastore.new_read_only_transaction();
    assert_eq!(outsider.read(&x).await.unwrap(), None);

    tx2.write(x.clone(), leaf("from tx2")).await.unwrap();
    let tx2_commit = tx2.ready().unwrap();
    tx1_commit.submit().await.unwrap();
    tx2_commit.submit().await.unwrap();

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&x).await.unwrap(), Some(leaf("from tx2")));
    directory.shutdown().await;
}

#[tokio::test]
async fn chain_successor_waits_behind_predecessor_in_queue() {
    let (directory, datastore) = single_member(&["default"]);
    let chain = datastore.create_transaction_chain();

    let mut tx1 = chain.new_write_only_transaction().unwrap();
    tx1.write(Path::parse("/n"), leaf("1")).await.unwrap();
    let tx1_commit = tx1.ready().unwrap();

    let mut tx2 = chain.new_write_only_transaction().unwrap();
    tx2.write(Path::parse("/n"), leaf("2")).await.unwrap();
    let tx2_commit = tx2.ready().unwrap();

    // The successor's can_commit is held until the predecessor commits.
    let second = tokio::spawn(tx2_commit.submit());
    tokio::task::yield_now().await;
    tx1_commit.submit().await.unwrap();
    second.await.unwrap().unwrap();

    let reader = datastore.new_read_only_transaction();
    assert_eq!(reader.read(&Path::parse("/n")).await.unwrap(), Some(leaf("2")));
    directory.shutdown().await;
}

#[tokio::test]
async fn chain_cancel_releases_the_open_slot() {
    let (directory, datastore) = single_member(&["default"]);
    let chain = datastore.create_transaction_chain();

    let mut tx1 = chain.new_read_only_transaction().unwrap();
    tx1.cancel().unwrap();
    let tx2 = chain.new_read_write_transaction().unwrap();
    drop(tx2);
    let tx3 = chain.new_write_only_transaction().unwrap();
    assert_eq!(tx3.txid().seq, 2);
    assert_eq!(tx3.txid().history, *chain.history());
    directory.shutdown().await;
}

#[tokio::test]
async fn closed_chain_rejects_new_transactions() {
    let (directory, datastore) = single_member(&["default"]);
    let chain = datastore.create_transaction_chain();

    let open = chain.new_write_only_transaction().unwrap();
    assert!(matches!(chain.close(), Err(DatastoreError::ChainState { .. })));
    drop(open);

    let mut tx = chain.new_write_only_transaction().unwrap();
    tx.write(Path::parse("/a"), leaf("1")).await.unwrap();
    let pending = tx.ready().unwrap();

    // Closing with a readied, uncommitted transaction is allowed.
    chain.close().unwrap();
    chain.close().unwrap();
    assert!(chain.is_closed());
    assert!(matches!(
        chain.new_read_only_transaction(),
        Err(DatastoreError::ChainState { .. })
    ));

    pending.submit().await.unwrap();
    chain.closed().await;
    directory.shutdown().await;
}

#[tokio::test]
async fn aborted_predecessor_fails_the_chain() {
    let (directory, datastore) = single_member(&["default"]);
    let chain = datastore.create_transaction_chain();

    let mut tx1 = chain.new_write_only_transaction().unwrap();
    tx1.write(Path::parse("/a"), leaf("1")).await.unwrap();
    let mut tx1_commit = tx1.ready().unwrap();
    tx1_commit.abort().await.unwrap();

    assert!(chain.is_failed());
    assert!(matches!(
        chain.new_write_only_transaction(),
        Err(DatastoreError::ChainState { .. })
    ));
    directory.shutdown().await;
}

#[tokio::test]
async fn closed_chain_history_is_purged_on_every_shard() {
    let (directory, datastore) = single_member(&["default", "cars"]);
    let chain = datastore.create_transaction_chain();

    // seq 0 on default, seq 1 on cars, seq 2 on default: the default shard
    // learns that seq 1 never touched it.
    for (path, value) in [("/a", "0"), ("/cars/b", "1"), ("/a", "2")] {
        let mut tx = chain.new_write_only_transaction().unwrap();
        tx.write(Path::parse(path), leaf(value)).await.unwrap();
        tx.ready().unwrap().submit().await.unwrap();
    }
    chain.close().unwrap();
    chain.closed().await;

    for shard in ["default", "cars"] {
        let leader = directory.find_primary(&ShardName::new(shard), true).await.unwrap();
        let status = leader.status().await.unwrap();
        assert!(
            status.purged_histories.contains(chain.history()),
            "history not purged on {shard}: {status:?}"
        );
        assert!(!status.live_histories.contains(chain.history()));
    }
    directory.shutdown().await;
}

#[tokio::test]
async fn transactions_fail_for_unknown_shard() {
    let member = MemberName::new(MEMBER);
    let cluster = Arc::new(LocalCluster::new());
    let directory =
        PartitionDirectory::in_cluster(member.clone(), DatastoreConfig::for_testing(), &cluster)
            .unwrap();
    let datastore = Datastore::new(
        ClientId::new(member, 0),
        Arc::clone(&directory),
        Arc::new(PrefixShardStrategy::new(ShardName::new("missing"))),
    );

    let reader = datastore.new_read_only_transaction();
    assert!(matches!(
        reader.read(&Path::parse("/a")).await,
        Err(DatastoreError::ShardNotFound { .. })
    ));

    let mut tx = datastore.new_write_only_transaction();
    tx.write(Path::parse("/a"), leaf("1")).await.unwrap();
    let err = datastore.commit(tx).await.unwrap_err();
    assert!(matches!(err.root_cause(), DatastoreError::ShardNotFound { .. }));
}
