//! Stress harnesses.
//!
//! Many concurrent clients committing transactions that span overlapping
//! shard sets, which is the load that exercises commit queue reordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{Datastore, Node, Path};
use tokio::task::JoinSet;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total transactions attempted.
    pub total_ops: usize,
    /// Transactions that committed.
    pub successful_ops: usize,
    /// Transactions that failed.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total transactions: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} tx/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Concurrent clients.
    pub clients: usize,
    /// Transactions per client.
    pub transactions_per_client: usize,
    /// Top-level segments to spread writes over. Each transaction writes
    /// under two of them, in an order that depends on the client.
    pub prefixes: Vec<String>,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            transactions_per_client: 25,
            prefixes: vec!["a".to_owned(), "b".to_owned()],
        }
    }
}

/// Runs concurrent cross-shard commits and counts outcomes.
///
/// Client `c`, transaction `i` writes `/<p1>/c<c>-<i>` then `/<p2>/c<c>-<i>`
/// where `p1` and `p2` are consecutive prefixes starting at offset `c`, so
/// neighbouring clients touch the same shards in opposite staging orders.
pub async fn stress_cross_shard_commits(
    datastore: Arc<Datastore>,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let prefixes = Arc::new(config.prefixes.clone());
    let start = Instant::now();

    let mut clients = JoinSet::new();
    for client in 0..config.clients {
        let datastore = Arc::clone(&datastore);
        let successful = Arc::clone(&successful);
        let failed = Arc::clone(&failed);
        let prefixes = Arc::clone(&prefixes);
        let count = config.transactions_per_client;

        clients.spawn(async move {
            let n = prefixes.len().max(1);
            for i in 0..count {
                let first = &prefixes[client % n];
                let second = &prefixes[(client + 1) % n];
                let key = format!("c{client}-{i}");
                let mut tx = datastore.new_write_only_transaction();
                let staged = async {
                    tx.write(Path::new([first.as_str(), key.as_str()]), Node::leaf(key.clone()))
                        .await?;
                    tx.write(Path::new([second.as_str(), key.as_str()]), Node::leaf(key.clone()))
                        .await
                };
                let outcome = match staged.await {
                    Ok(()) => datastore.commit(tx).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        });
    }
    while clients.join_next().await.is_some() {}

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
