//! Journal writer.

use super::iterator::JournalIterator;
use super::record::JournalRecord;
use crate::error::DatastoreResult;
use tessera_storage::StorageBackend;

/// Append-only record log for one partition.
///
/// Owned by the partition actor, so no locking is needed.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_append: bool,
}

impl Journal {
    /// Wraps a backend. With `sync_on_append`, every append is followed by
    /// a flush to durable storage.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_append: bool) -> Self {
        Self {
            backend,
            sync_on_append,
        }
    }

    /// Appends a record and returns its encoded size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn append(&mut self, record: &JournalRecord) -> DatastoreResult<u64> {
        let frame = record.encode_frame()?;
        self.backend.append(&frame)?;
        if self.sync_on_append {
            self.backend.sync()?;
        }
        Ok(frame.len() as u64)
    }

    /// Appends several records with a single flush.
    ///
    /// Returns the encoded size of each record in order.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or a write fails.
    pub fn append_all<'r>(
        &mut self,
        records: impl IntoIterator<Item = &'r JournalRecord>,
    ) -> DatastoreResult<Vec<u64>> {
        let mut sizes = Vec::new();
        for record in records {
            let frame = record.encode_frame()?;
            self.backend.append(&frame)?;
            sizes.push(frame.len() as u64);
        }
        if self.sync_on_append {
            self.backend.sync()?;
        }
        Ok(sizes)
    }

    /// Replaces the journal content with `records`.
    ///
    /// Used after a snapshot (marker plus the retained tail) and when a
    /// follower drops conflicting entries.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the rewrite fails.
    pub fn compact<'r>(
        &mut self,
        records: impl IntoIterator<Item = &'r JournalRecord>,
    ) -> DatastoreResult<()> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&record.encode_frame()?);
        }
        self.backend.rewrite(&data)?;
        Ok(())
    }

    /// Flushes buffered writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&mut self) -> DatastoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn size(&self) -> DatastoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Streams the journal's records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> DatastoreResult<JournalIterator<'_>> {
        JournalIterator::new(self.backend.as_ref())
    }

    /// Reads every record into memory.
    ///
    /// # Errors
    ///
    /// Returns the first read or decode error.
    pub fn read_all(&self) -> DatastoreResult<Vec<JournalRecord>> {
        self.iter()?
            .map(|result| result.map(|(_, record)| record))
            .collect()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}
