//! Partition snapshots and their durable store.
//!
//! A snapshot captures everything a partition needs to resume without the
//! entries it covers: the data tree, the frontend history metadata and the
//! log position it was taken at. The store keeps exactly one snapshot per
//! partition, framed as:
//!
//! ```text
//! | magic "TSNP" (4) | version (2) | length (8) | CBOR payload | crc32 (4) |
//! ```

use crate::error::{DatastoreError, DatastoreResult};
use crate::frontend::FrontendMetadataSnapshot;
use crate::journal::compute_crc32;
use crate::tree::Node;
use crate::types::{LogIndex, ShardName, Term};
use serde::{Deserialize, Serialize};
use tessera_storage::StorageBackend;

const SNAPSHOT_MAGIC: [u8; 4] = *b"TSNP";
const SNAPSHOT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 14;
const CRC_SIZE: usize = 4;

/// Point-in-time state of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Partition the snapshot belongs to.
    pub shard: ShardName,
    /// Last log index folded into the snapshot.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
    /// Data tree root.
    pub root: Node,
    /// Frontend history metadata.
    pub frontend: FrontendMetadataSnapshot,
}

impl PartitionSnapshot {
    /// Encodes the snapshot with its envelope.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if encoding fails.
    pub fn encode(&self) -> DatastoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload)?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&SNAPSHOT_MAGIC);
        data.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Decodes a snapshot written by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for a bad envelope, `ChecksumMismatch` if the
    /// checksum does not match and `Codec` if the payload is undecodable.
    pub fn decode(data: &[u8]) -> DatastoreResult<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(DatastoreError::corruption(format!(
                "snapshot too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != SNAPSHOT_MAGIC {
            return Err(DatastoreError::corruption("invalid snapshot magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > SNAPSHOT_VERSION {
            return Err(DatastoreError::corruption(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[6..14]);
        let len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| DatastoreError::corruption("snapshot length overflows"))?;
        if data.len() != HEADER_SIZE + len + CRC_SIZE {
            return Err(DatastoreError::corruption(format!(
                "snapshot length {len} does not match {} stored bytes",
                data.len()
            )));
        }

        let body_end = HEADER_SIZE + len;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&data[body_end..]);
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = compute_crc32(&data[..body_end]);
        if expected != actual {
            return Err(DatastoreError::ChecksumMismatch { expected, actual });
        }

        Ok(ciborium::from_reader(&data[HEADER_SIZE..body_end])?)
    }
}

/// Durable home of a partition's latest snapshot.
pub struct SnapshotStore {
    backend: Box<dyn StorageBackend>,
}

impl SnapshotStore {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Loads the stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored bytes cannot be read or decoded.
    pub fn load(&self) -> DatastoreResult<Option<PartitionSnapshot>> {
        if self.backend.size()? == 0 {
            return Ok(None);
        }
        let data = self.backend.read_all()?;
        PartitionSnapshot::decode(&data).map(Some)
    }

    /// Replaces the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn save(&mut self, snapshot: &PartitionSnapshot) -> DatastoreResult<()> {
        let data = snapshot.encode()?;
        self.backend.rewrite(&data)?;
        Ok(())
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Path;
    use tessera_storage::InMemoryBackend;

    fn sample() -> PartitionSnapshot {
        PartitionSnapshot {
            shard: ShardName::new("cars"),
            last_index: LogIndex::new(42),
            last_term: Term::new(3),
            root: Node::container().with_child("a", Node::leaf(b"1".to_vec())),
            frontend: FrontendMetadataSnapshot::default(),
        }
    }

    #[test]
    fn empty_store_has_no_snapshot() {
        let store = SnapshotStore::new(Box::new(InMemoryBackend::new()));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let backend = InMemoryBackend::new();
        let mut store = SnapshotStore::new(Box::new(backend.clone()));
        store.save(&sample()).unwrap();

        let reopened = SnapshotStore::new(Box::new(backend));
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(
            loaded
                .root
                .descendant(Path::parse("/a").segments())
                .and_then(Node::value),
            Some(&b"1"[..])
        );
    }

    #[test]
    fn save_replaces_previous() {
        let mut store = SnapshotStore::new(Box::new(InMemoryBackend::new()));
        store.save(&sample()).unwrap();
        let mut newer = sample();
        newer.last_index = LogIndex::new(50);
        store.save(&newer).unwrap();
        assert_eq!(store.load().unwrap().unwrap().last_index, LogIndex::new(50));
    }

    #[test]
    fn corrupted_snapshot_is_detected() {
        let backend = InMemoryBackend::new();
        let mut store = SnapshotStore::new(Box::new(backend.clone()));
        store.save(&sample()).unwrap();
        backend.corrupt_byte(HEADER_SIZE + 2);

        assert!(matches!(
            store.load(),
            Err(DatastoreError::ChecksumMismatch { .. })
        ));
    }
}
