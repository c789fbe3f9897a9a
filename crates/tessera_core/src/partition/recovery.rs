//! Partition startup: snapshot load and journal replay.

use super::actor::PartitionActor;
use super::state::StateMachine;
use crate::error::{DatastoreError, DatastoreResult};
use crate::journal::JournalRecord;
use crate::replication::ReplicatedLog;
use tracing::{debug, info};

impl PartitionActor {
    /// Restores state from the stored snapshot and the journal.
    ///
    /// Entries up to the last recorded applied index are replayed through
    /// the runtime apply path, `journal_recovery_batch_size` at a time,
    /// yielding between batches. Later entries stay in the log
    /// uncommitted until a leader commits them.
    pub(super) async fn recover(&mut self) -> DatastoreResult<()> {
        if let Some(snapshot) = self.snapshot_store.load()? {
            if snapshot.shard != self.shard {
                return Err(DatastoreError::corruption(format!(
                    "snapshot for shard {} found in storage of shard {}",
                    snapshot.shard, self.shard
                )));
            }
            let (index, term) = (snapshot.last_index, snapshot.last_term);
            self.state = StateMachine::from_snapshot(snapshot);
            self.log = ReplicatedLog::from_snapshot(index, term);
            debug!(shard = %self.shard, %index, "loaded snapshot");
        }

        let mut applied_to = self.log.last_applied();
        let mut iter = self.journal.iter()?;
        while let Some(item) = iter.next() {
            let (offset, record) = item?;
            let size = iter.offset() - offset;
            match record {
                JournalRecord::Entry(entry) => {
                    if entry.index <= self.log.snapshot_index() {
                        continue;
                    }
                    if entry.index <= self.log.last_index() {
                        self.log.truncate_from(entry.index);
                    }
                    if entry.index != self.log.last_index().next() {
                        return Err(DatastoreError::corruption(format!(
                            "journal of shard {} jumps from {} to {}",
                            self.shard,
                            self.log.last_index(),
                            entry.index
                        )));
                    }
                    self.log.append(entry, size);
                }
                JournalRecord::Applied { index } => applied_to = applied_to.max(index),
                JournalRecord::SnapshotMarker { index, .. } => {
                    if index > self.log.snapshot_index() {
                        return Err(DatastoreError::corruption(format!(
                            "journal of shard {} expects a snapshot at {index}, stored snapshot ends at {}",
                            self.shard,
                            self.log.snapshot_index()
                        )));
                    }
                }
            }
        }
        drop(iter);

        self.log.set_commit_index(applied_to);
        let batch_size = self.config.journal_recovery_batch_size.max(1);
        let mut replayed = 0usize;
        loop {
            let mut in_batch = 0usize;
            while in_batch < batch_size {
                let Some(entry) = self.log.next_to_apply().cloned() else {
                    break;
                };
                // Failures are logged by the state machine and skipped, as
                // they were when the entry was first applied.
                let _ = self.state.apply(&self.shard, &entry);
                self.log.mark_applied(entry.index);
                in_batch += 1;
            }
            replayed += in_batch;
            if in_batch < batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        self.term = self.log.last_term();
        info!(
            shard = %self.shard,
            member = %self.member,
            replayed,
            last_applied = %self.log.last_applied(),
            uncommitted = self.log.last_index().as_u64() - self.log.last_applied().as_u64(),
            "partition recovered"
        );
        Ok(())
    }
}
