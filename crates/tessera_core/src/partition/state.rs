//! The replicated state machine of a partition.

use crate::error::DatastoreResult;
use crate::frontend::FrontendMetadata;
use crate::replication::{LogEntry, Payload};
use crate::snapshot::PartitionSnapshot;
use crate::tree::{DataTree, Node};
use crate::types::{LogIndex, ShardName, Term};
use tracing::{error, trace};

/// Data tree plus frontend metadata, changed only by applying committed
/// log entries in order. Runtime and recovery share this path.
#[derive(Debug, Default)]
pub(crate) struct StateMachine {
    tree: DataTree,
    frontend: FrontendMetadata,
}

impl StateMachine {
    pub fn from_snapshot(snapshot: PartitionSnapshot) -> Self {
        Self {
            tree: DataTree::from_root(snapshot.root),
            frontend: FrontendMetadata::from_snapshot(snapshot.frontend),
        }
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    pub fn frontend(&self) -> &FrontendMetadata {
        &self.frontend
    }

    /// Applies one committed entry.
    ///
    /// A commit whose modifications no longer apply leaves the tree alone
    /// and is recorded as aborted. Frontend violations are reported but
    /// never repaired. Both are logged here and returned so callers can
    /// fail a waiting reply.
    pub fn apply(&mut self, shard: &ShardName, entry: &LogEntry) -> DatastoreResult<()> {
        trace!(%shard, index = %entry.index, "applying entry");
        if let Payload::CommitTransaction { txid, modifications } = &entry.payload {
            if let Err(e) = self.tree.apply(modifications) {
                error!(%shard, %txid, index = %entry.index, error = %e, "committed modifications failed to apply");
                let aborted = Payload::AbortTransaction { txid: txid.clone() };
                self.apply_frontend(shard, entry.index, &aborted)?;
                return Err(e);
            }
        }
        self.apply_frontend(shard, entry.index, &entry.payload)
    }

    fn apply_frontend(
        &mut self,
        shard: &ShardName,
        index: LogIndex,
        payload: &Payload,
    ) -> DatastoreResult<()> {
        self.frontend.apply(payload).map_err(|e| {
            error!(%shard, %index, error = %e, "frontend metadata invariant violated");
            e
        })
    }

    /// Captures the current state as of `index`.
    pub fn snapshot(&self, shard: &ShardName, index: LogIndex, term: Term) -> PartitionSnapshot {
        PartitionSnapshot {
            shard: shard.clone(),
            last_index: index,
            last_term: term,
            root: self.tree.root().clone(),
            frontend: self.frontend.snapshot(),
        }
    }

    /// Returns the tree root.
    pub fn root(&self) -> &Node {
        self.tree.root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Modification, Path};
    use crate::types::{ClientId, HistoryId, MemberName, TransactionId};

    fn commit(index: u64, seq: u64, path: &str) -> LogEntry {
        let history = HistoryId::new(ClientId::new(MemberName::new("m"), 0), 1);
        LogEntry {
            index: LogIndex::new(index),
            term: Term::new(1),
            payload: Payload::CommitTransaction {
                txid: TransactionId::new(history, seq),
                modifications: vec![Modification::Write {
                    path: Path::parse(path),
                    data: Node::leaf(b"v".to_vec()),
                }],
            },
        }
    }

    #[test]
    fn apply_updates_tree_and_frontend() {
        let shard = ShardName::new("s");
        let mut machine = StateMachine::default();
        machine.apply(&shard, &commit(1, 0, "/a")).unwrap();

        assert!(machine.tree().read(&Path::parse("/a")).is_some());
        let history = HistoryId::new(ClientId::new(MemberName::new("m"), 0), 1);
        assert_eq!(
            machine.frontend().history(&history).unwrap().finished(0),
            Some(true)
        );
    }

    #[test]
    fn snapshot_restores_state() {
        let shard = ShardName::new("s");
        let mut machine = StateMachine::default();
        machine.apply(&shard, &commit(1, 0, "/a")).unwrap();

        let snapshot = machine.snapshot(&shard, LogIndex::new(1), Term::new(1));
        let restored = StateMachine::from_snapshot(snapshot);
        assert_eq!(restored.root(), machine.root());
        assert_eq!(restored.frontend(), machine.frontend());
    }

    #[test]
    fn invalid_commit_leaves_tree_untouched() {
        let shard = ShardName::new("s");
        let mut machine = StateMachine::default();
        machine.apply(&shard, &commit(1, 0, "/a")).unwrap();
        let before = machine.root().clone();

        // "/a" is a leaf, so nothing can be written beneath it.
        assert!(machine.apply(&shard, &commit(2, 1, "/a/b")).is_err());
        assert_eq!(machine.root(), &before);

        let history = HistoryId::new(ClientId::new(MemberName::new("m"), 0), 1);
        assert_eq!(
            machine.frontend().history(&history).unwrap().finished(1),
            Some(false)
        );
    }
}
