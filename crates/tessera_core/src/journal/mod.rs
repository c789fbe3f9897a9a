//! Partition journal.
//!
//! The durable form of a partition's replicated log. Every record is framed
//! as:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! Entry payloads are CBOR. A record cut short at the tail (a crash during
//! append) ends the journal; a checksum mismatch anywhere is corruption.
//!
//! Besides log entries, the journal records how far entries were applied
//! (so recovery knows which entries are committed) and where the latest
//! snapshot ends (so recovery skips entries it already covers).

mod iterator;
mod record;
mod writer;

pub use iterator::JournalIterator;
pub use record::{JournalRecord, JournalRecordType, JOURNAL_MAGIC, JOURNAL_VERSION};
pub(crate) use record::compute_crc32;
pub use writer::Journal;
