//! Journal record types and framing.

use crate::error::{DatastoreError, DatastoreResult};
use crate::replication::LogEntry;
use crate::types::{LogIndex, Term};

/// Magic bytes opening every journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TJNL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type byte of a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// A replicated log entry.
    Entry = 1,
    /// Entries up to an index have been applied.
    Applied = 2,
    /// A snapshot covers entries up to an index.
    SnapshotMarker = 3,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Entry),
            2 => Some(Self::Applied),
            3 => Some(Self::SnapshotMarker),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A replicated log entry.
    Entry(LogEntry),
    /// Entries up to and including `index` were applied.
    Applied {
        /// Last applied index.
        index: LogIndex,
    },
    /// The stored snapshot covers entries up to `index`.
    SnapshotMarker {
        /// Snapshot index.
        index: LogIndex,
        /// Snapshot term.
        term: Term,
    },
}

impl JournalRecord {
    /// Returns the type of this record.
    #[must_use]
    pub fn record_type(&self) -> JournalRecordType {
        match self {
            Self::Entry(_) => JournalRecordType::Entry,
            Self::Applied { .. } => JournalRecordType::Applied,
            Self::SnapshotMarker { .. } => JournalRecordType::SnapshotMarker,
        }
    }

    /// Serializes the record payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the entry cannot be encoded.
    pub fn encode_payload(&self) -> DatastoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Entry(entry) => ciborium::into_writer(entry, &mut buf)?,
            Self::Applied { index } => buf.extend_from_slice(&index.as_u64().to_le_bytes()),
            Self::SnapshotMarker { index, term } => {
                buf.extend_from_slice(&index.as_u64().to_le_bytes());
                buf.extend_from_slice(&term.as_u64().to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for malformed fixed-size payloads and `Codec`
    /// for undecodable entries.
    pub fn decode_payload(record_type: JournalRecordType, payload: &[u8]) -> DatastoreResult<Self> {
        let read_u64 = |at: usize| -> DatastoreResult<u64> {
            payload
                .get(at..at + 8)
                .and_then(|bytes| bytes.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| DatastoreError::corruption("unexpected end of journal payload"))
        };

        match record_type {
            JournalRecordType::Entry => Ok(Self::Entry(ciborium::from_reader(payload)?)),
            JournalRecordType::Applied => {
                if payload.len() != 8 {
                    return Err(DatastoreError::corruption(format!(
                        "applied record has {} payload bytes, expected 8",
                        payload.len()
                    )));
                }
                Ok(Self::Applied {
                    index: LogIndex::new(read_u64(0)?),
                })
            }
            JournalRecordType::SnapshotMarker => {
                if payload.len() != 16 {
                    return Err(DatastoreError::corruption(format!(
                        "snapshot marker has {} payload bytes, expected 16",
                        payload.len()
                    )));
                }
                Ok(Self::SnapshotMarker {
                    index: LogIndex::new(read_u64(0)?),
                    term: Term::new(read_u64(8)?),
                })
            }
        }
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or exceeds 4 GiB.
    pub fn encode_frame(&self) -> DatastoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| DatastoreError::invalid_operation("journal record payload too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.push(self.record_type().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// CRC32 (IEEE) of `data`.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}
