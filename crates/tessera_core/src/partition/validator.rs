//! Commit-time validation hooks.

use crate::error::DatastoreResult;
use crate::tree::{Modification, Path, TreeSnapshot};
use crate::types::TransactionId;

/// Veto point consulted during `can_commit`.
///
/// A validator watches one subtree. When a transaction modifies anything
/// that overlaps it, the partition leader calls [`validate`](Self::validate)
/// with the state the tree would have after the transaction. Returning an
/// error fails `can_commit` for that transaction.
pub trait CommitValidator: Send + Sync {
    /// Subtree this validator watches.
    fn subtree(&self) -> &Path;

    /// Accepts or rejects `modifications`.
    ///
    /// # Errors
    ///
    /// Any error vetoes the transaction; `Validation` is conventional.
    fn validate(
        &self,
        txid: &TransactionId,
        modifications: &[Modification],
        candidate: &TreeSnapshot,
    ) -> DatastoreResult<()>;
}

/// Returns true if any modification touches `validator`'s subtree.
pub(crate) fn is_interested(validator: &dyn CommitValidator, modifications: &[Modification]) -> bool {
    let subtree = validator.subtree();
    modifications.iter().any(|m| m.path().overlaps(subtree))
}
