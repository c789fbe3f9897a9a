//! Streaming journal reader.

use super::record::{
    compute_crc32, JournalRecord, JournalRecordType, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
use crate::error::{DatastoreError, DatastoreResult};
use tessera_storage::StorageBackend;

/// Iterates over the records of a journal, one read per record.
///
/// Yields `(offset, record)` pairs. A record cut short at the tail ends
/// iteration quietly; bad magic, an unknown type or a checksum mismatch
/// yields an error and ends iteration.
pub struct JournalIterator<'a> {
    backend: &'a dyn StorageBackend,
    offset: u64,
    size: u64,
    finished: bool,
}

impl<'a> JournalIterator<'a> {
    /// Starts reading `backend` at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend) -> DatastoreResult<Self> {
        Ok(Self {
            backend,
            offset: 0,
            size: backend.size()?,
            finished: false,
        })
    }

    /// Offset just past the last record returned.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> DatastoreResult<Option<(u64, JournalRecord)>> {
        let start = self.offset;
        let remaining = self.size - start;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != JOURNAL_MAGIC {
            return Err(DatastoreError::corruption(format!(
                "invalid journal magic at offset {start}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(DatastoreError::corruption(format!(
                "unsupported journal version {version} at offset {start}"
            )));
        }
        let type_byte = header[6];
        let record_type = JournalRecordType::from_byte(type_byte).ok_or_else(|| {
            DatastoreError::corruption(format!(
                "unknown journal record type {type_byte} at offset {start}"
            ))
        })?;
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let frame_len = (HEADER_SIZE + len + CRC_SIZE) as u64;
        if remaining < frame_len {
            // torn write at the tail
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(len);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut covered = header;
        covered.extend_from_slice(payload);
        let actual = compute_crc32(&covered);
        if actual != expected {
            return Err(DatastoreError::ChecksumMismatch { expected, actual });
        }

        let record = JournalRecord::decode_payload(record_type, payload)?;
        self.offset = start + frame_len;
        Ok(Some((start, record)))
    }
}

impl Iterator for JournalIterator<'_> {
    type Item = DatastoreResult<(u64, JournalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
