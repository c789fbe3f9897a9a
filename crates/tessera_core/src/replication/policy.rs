//! When a partition captures a snapshot.

use std::fmt;

/// Reason a snapshot is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    /// An applied transaction replaced the tree root.
    RootOverwrite,
    /// Retained entries reached the batch count.
    EntryCount,
    /// Retained journal bytes exceeded the data threshold.
    DataSize,
    /// Explicitly requested through the partition handle.
    Requested,
}

impl fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::RootOverwrite => "root overwrite",
            Self::EntryCount => "entry count",
            Self::DataSize => "data size",
            Self::Requested => "requested",
        };
        f.write_str(reason)
    }
}

/// Thresholds that make a partition snapshot and trim its log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotPolicy {
    batch_count: u64,
    data_threshold: u64,
}

impl SnapshotPolicy {
    pub const fn new(batch_count: u64, data_threshold: u64) -> Self {
        Self {
            batch_count,
            data_threshold,
        }
    }

    /// Decides whether to snapshot after applying an entry.
    ///
    /// A root overwrite always snapshots; otherwise the retained entry count
    /// and journal size are compared with the thresholds.
    pub fn evaluate(
        &self,
        root_overwrite: bool,
        retained_entries: u64,
        retained_bytes: u64,
    ) -> Option<SnapshotTrigger> {
        if root_overwrite {
            Some(SnapshotTrigger::RootOverwrite)
        } else if retained_entries >= self.batch_count {
            Some(SnapshotTrigger::EntryCount)
        } else if retained_bytes > self.data_threshold {
            Some(SnapshotTrigger::DataSize)
        } else {
            None
        }
    }
}
