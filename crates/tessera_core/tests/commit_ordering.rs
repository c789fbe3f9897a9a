//! Cross-shard commit ordering: crossed queues, prefix mismatches and
//! deterministic grant order.
//!
//! These tests talk to partition handles directly so the order in which
//! transactions reach each queue is under the test's control.

use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    ClientId, DatastoreConfig, HistoryId, LocalCluster, MemberName, Modification, Node,
    ParticipatingShards, PartitionDirectory, PartitionHandle, PartitionSpec, Path, ShardName,
    TransactionId,
};
use tokio::sync::mpsc;

struct Shards {
    directory: Arc<PartitionDirectory>,
}

impl Shards {
    fn start(names: &[&str]) -> Self {
        let member = MemberName::new("member-1");
        let cluster = Arc::new(LocalCluster::new());
        let directory =
            PartitionDirectory::in_cluster(member.clone(), DatastoreConfig::for_testing(), &cluster)
                .unwrap();
        for name in names {
            directory
                .create_partition(ShardName::new(name), PartitionSpec::in_memory(vec![member.clone()]))
                .unwrap();
        }
        Self { directory }
    }

    async fn leader(&self, name: &str) -> PartitionHandle {
        self.directory
            .find_primary(&ShardName::new(name), true)
            .await
            .unwrap()
    }
}

fn txid(seq: u64) -> TransactionId {
    TransactionId::new(
        HistoryId::standalone(ClientId::new(MemberName::new("client"), 0)),
        seq,
    )
}

fn shards(names: &[&str]) -> ParticipatingShards {
    ParticipatingShards::new(names.iter().map(ShardName::new))
}

fn write(path: &str, value: &str) -> Vec<Modification> {
    vec![Modification::Write {
        path: Path::parse(path),
        data: Node::leaf(value),
    }]
}

/// Runs can_commit on every handle in order, then commits on all of them,
/// reporting each can_commit grant on `grants`.
async fn drive(
    txid: TransactionId,
    handles: Vec<PartitionHandle>,
    grants: mpsc::UnboundedSender<(TransactionId, ShardName)>,
) {
    for handle in &handles {
        handle.can_commit(txid.clone()).await.unwrap();
        let _ = grants.send((txid.clone(), handle.shard().clone()));
    }
    for handle in &handles {
        handle.commit(txid.clone()).await.unwrap();
    }
}

/// tx1 and tx2 both span [A, B] but reach the queues in opposite orders:
/// A holds [tx1, tx2] and B holds [tx2, tx1].
async fn crossed_queues(shards: &Shards) -> Vec<(TransactionId, ShardName)> {
    let a = shards.leader("A").await;
    let b = shards.leader("B").await;
    let both = self::shards(&["A", "B"]);
    let (tx1, tx2) = (txid(1), txid(2));

    a.ready(tx1.clone(), both.clone(), write("/x1", "1"), Vec::new()).await.unwrap();
    b.ready(tx2.clone(), both.clone(), write("/y2", "2"), Vec::new()).await.unwrap();
    b.ready(tx1.clone(), both.clone(), write("/y1", "1"), Vec::new()).await.unwrap();
    a.ready(tx2.clone(), both.clone(), write("/x2", "2"), Vec::new()).await.unwrap();

    let (grants_tx, mut grants_rx) = mpsc::unbounded_channel();
    let first = tokio::spawn(drive(tx1, vec![a.clone(), b.clone()], grants_tx.clone()));
    let second = tokio::spawn(drive(tx2, vec![a, b], grants_tx));

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        first.await.unwrap();
        second.await.unwrap();
    })
    .await;
    assert!(finished.is_ok(), "crossed transactions deadlocked");

    let mut grants = Vec::new();
    while let Ok(grant) = grants_rx.try_recv() {
        grants.push(grant);
    }
    grants
}

#[tokio::test]
async fn crossed_queues_both_complete() {
    let shards = Shards::start(&["A", "B"]);
    let grants = crossed_queues(&shards).await;
    assert_eq!(grants.len(), 4);

    let b = shards.leader("B").await;
    for path in ["/y1", "/y2"] {
        assert!(b.read(Path::parse(path)).await.unwrap().is_some());
    }
    let status = b.status().await.unwrap();
    assert_eq!(status.queue_len, 0);
    shards.directory.shutdown().await;
}

#[tokio::test]
async fn crossed_queues_grant_in_the_same_order_every_run() {
    let mut orders = Vec::new();
    for _ in 0..3 {
        let shards = Shards::start(&["A", "B"]);
        orders.push(crossed_queues(&shards).await);
        shards.directory.shutdown().await;
    }
    // tx1 heads A and jumps tx2 on B because both share the prefix [A].
    let expected = vec![
        (txid(1), ShardName::new("A")),
        (txid(1), ShardName::new("B")),
        (txid(2), ShardName::new("A")),
        (txid(2), ShardName::new("B")),
    ];
    for order in orders {
        assert_eq!(order, expected);
    }
}

#[tokio::test]
async fn prefix_mismatch_is_held_until_head_finishes() {
    let shards = Shards::start(&["A", "B", "C"]);
    let a = shards.leader("A").await;
    let b = shards.leader("B").await;
    let c = shards.leader("C").await;
    let (tx1, tx2) = (txid(1), txid(2));

    // C's queue is [tx2, tx1]; tx1 arrives with prefix [A], tx2 with [B].
    a.ready(tx1.clone(), self::shards(&["A", "C"]), write("/a", "1"), Vec::new()).await.unwrap();
    c.ready(tx2.clone(), self::shards(&["B", "C"]), write("/c2", "2"), Vec::new()).await.unwrap();
    c.ready(tx1.clone(), self::shards(&["A", "C"]), write("/c1", "1"), Vec::new()).await.unwrap();
    b.ready(tx2.clone(), self::shards(&["B", "C"]), write("/b", "2"), Vec::new()).await.unwrap();

    a.can_commit(tx1.clone()).await.unwrap();
    let held = {
        let c = c.clone();
        let tx1 = tx1.clone();
        tokio::spawn(async move { c.can_commit(tx1).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!held.is_finished(), "tx1 jumped a head with a different prefix");

    b.can_commit(tx2.clone()).await.unwrap();
    c.can_commit(tx2.clone()).await.unwrap();
    b.commit(tx2.clone()).await.unwrap();
    c.commit(tx2).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), held)
        .await
        .expect("tx1 still held after tx2 finished")
        .unwrap()
        .unwrap();
    a.commit(tx1.clone()).await.unwrap();
    c.commit(tx1).await.unwrap();
    assert_eq!(c.read(Path::parse("/c1")).await.unwrap(), Some(Node::leaf("1")));
    shards.directory.shutdown().await;
}

#[tokio::test]
async fn unknown_transaction_is_rejected_but_abort_is_idempotent() {
    let shards = Shards::start(&["A"]);
    let a = shards.leader("A").await;
    assert!(matches!(
        a.can_commit(txid(9)).await,
        Err(tessera_core::DatastoreError::UnknownTransaction { .. })
    ));
    assert!(matches!(
        a.commit(txid(9)).await,
        Err(tessera_core::DatastoreError::UnknownTransaction { .. })
    ));
    a.abort(txid(9)).await.unwrap();
    shards.directory.shutdown().await;
}

#[tokio::test]
async fn failed_head_does_not_block_successors() {
    let shards = Shards::start(&["A"]);
    let a = shards.leader("A").await;
    let only = self::shards(&["A"]);

    a.ready(txid(1), only.clone(), write("/leaf", "v"), Vec::new()).await.unwrap();
    a.can_commit(txid(1)).await.unwrap();
    a.commit(txid(1)).await.unwrap();

    // Writing beneath a leaf fails validation at the head.
    a.ready(txid(2), only.clone(), write("/leaf/child", "x"), Vec::new()).await.unwrap();
    a.ready(txid(3), only.clone(), write("/other", "y"), Vec::new()).await.unwrap();
    let third = {
        let a = a.clone();
        tokio::spawn(async move { a.can_commit(txid(3)).await })
    };
    assert!(a.can_commit(txid(2)).await.is_err());
    third.await.unwrap().unwrap();
    a.commit(txid(3)).await.unwrap();
    shards.directory.shutdown().await;
}
