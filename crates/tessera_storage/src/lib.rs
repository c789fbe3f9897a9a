//! # Tessera Storage
//!
//! Byte-store backends underneath every Tessera partition.
//!
//! A partition keeps two byte stores: an append-only journal of replicated
//! log entries and a snapshot slot that is replaced wholesale each time a
//! snapshot is captured. Backends never interpret those bytes; framing,
//! checksums and encoding belong to `tessera_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - shared in-process buffer, survives a partition
//!   restart as long as a clone of the handle is kept
//! - [`FileBackend`] - a single OS file
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut journal = InMemoryBackend::new();
//! let offset = journal.append(b"entry").unwrap();
//! assert_eq!(journal.read_at(offset, 5).unwrap(), b"entry");
//!
//! let mut slot = InMemoryBackend::new();
//! slot.rewrite(b"snapshot v1").unwrap();
//! slot.rewrite(b"v2").unwrap();
//! assert_eq!(slot.read_all().unwrap(), b"v2");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
