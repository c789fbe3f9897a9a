//! Transaction lifecycle state and staged writes.

use super::chain::ChainInner;
use super::standalone::StandaloneSequencer;
use crate::error::{DatastoreError, DatastoreResult};
use crate::tree::Modification;
use crate::types::{ShardName, TransactionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What a transaction may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Reads only; cannot be readied.
    ReadOnly,
    /// Stages writes; cannot read.
    WriteOnly,
    /// Reads and stages writes.
    ReadWrite,
}

impl TransactionKind {
    /// Returns true if reads are allowed.
    #[must_use]
    pub fn can_read(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// Returns true if writes are allowed.
    #[must_use]
    pub fn can_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::WriteOnly => write!(f, "write-only"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Staging is allowed.
    Open,
    /// Participants are frozen; the commit protocol owns the transaction.
    Readied,
    /// Committed on every participant.
    Committed,
    /// Aborted, cancelled or failed.
    Aborted,
}

impl TransactionState {
    /// Returns true once the transaction has finished.
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Pending modifications grouped by the shard they belong to.
#[derive(Debug, Default)]
pub(crate) struct StagedWrites {
    by_shard: BTreeMap<ShardName, Vec<Modification>>,
}

impl StagedWrites {
    pub fn push(&mut self, shard: ShardName, modification: Modification) {
        self.by_shard.entry(shard).or_default().push(modification);
    }

    pub fn for_shard(&self, shard: &ShardName) -> &[Modification] {
        self.by_shard.get(shard).map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.by_shard.is_empty()
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardName> {
        self.by_shard.keys()
    }

    pub fn take(&mut self) -> BTreeMap<ShardName, Vec<Modification>> {
        std::mem::take(&mut self.by_shard)
    }
}

/// State shared between a transaction handle and its coordinator.
pub(crate) struct TransactionShared {
    txid: TransactionId,
    state: Mutex<TransactionState>,
    chain: Option<Arc<ChainInner>>,
    sequencer: Option<Arc<StandaloneSequencer>>,
}

impl TransactionShared {
    pub fn new(txid: TransactionId, chain: Option<Arc<ChainInner>>) -> Self {
        Self {
            txid,
            state: Mutex::new(TransactionState::Open),
            chain,
            sequencer: None,
        }
    }

    /// A standalone transaction whose number came from `sequencer`.
    pub fn standalone(txid: TransactionId, sequencer: Arc<StandaloneSequencer>) -> Self {
        Self {
            sequencer: Some(sequencer),
            ..Self::new(txid, None)
        }
    }

    pub fn txid(&self) -> &TransactionId {
        &self.txid
    }

    pub fn chain(&self) -> Option<&Arc<ChainInner>> {
        self.chain.as_ref()
    }

    pub fn sequencer(&self) -> Option<&Arc<StandaloneSequencer>> {
        self.sequencer.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Fails unless the transaction is still open.
    pub fn check_open(&self) -> DatastoreResult<()> {
        match self.state() {
            TransactionState::Open => Ok(()),
            TransactionState::Readied => Err(DatastoreError::AlreadyReadied {
                txid: self.txid.clone(),
            }),
            TransactionState::Committed | TransactionState::Aborted => {
                Err(DatastoreError::TransactionClosed {
                    txid: self.txid.clone(),
                })
            }
        }
    }

    /// Moves an open transaction to `Readied`.
    pub fn mark_readied(&self) -> DatastoreResult<()> {
        let mut state = self.state.lock();
        match *state {
            TransactionState::Open => {
                *state = TransactionState::Readied;
                Ok(())
            }
            TransactionState::Readied => Err(DatastoreError::AlreadyReadied {
                txid: self.txid.clone(),
            }),
            TransactionState::Committed | TransactionState::Aborted => {
                Err(DatastoreError::TransactionClosed {
                    txid: self.txid.clone(),
                })
            }
        }
    }

    /// Records the final outcome and tells the chain, once.
    pub fn finish(&self, committed: bool) {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            *state = if committed {
                TransactionState::Committed
            } else {
                TransactionState::Aborted
            };
        }
        if let Some(chain) = &self.chain {
            chain.transaction_finished(&self.txid, committed);
        }
    }

    /// Closes an open transaction without readying it. Returns false if it
    /// was not open.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != TransactionState::Open {
                return false;
            }
            *state = TransactionState::Aborted;
        }
        if let Some(chain) = &self.chain {
            chain.transaction_cancelled(&self.txid);
        }
        if let Some(sequencer) = &self.sequencer {
            sequencer.cancelled(self.txid.seq);
        }
        true
    }
}
