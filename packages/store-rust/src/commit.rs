//! Commit step shared by the backend-bound transactions.

use kvtx_core::{Result, StoreError, StructureKind, TxState};
use parking_lot::Mutex;

use crate::backend::{Backend, ConditionalWrite};

/// Guarded transaction state the commit step settles.
pub(crate) trait TxInner: Send {
    fn state_mut(&mut self) -> &mut TxState;
}

/// Moves the transaction to `RolledBack` unless disarmed.
///
/// Held across the backend await, so a commit future dropped before the
/// backend answers leaves a rolled-back transaction behind.
struct RollbackOnDrop<'a, I: TxInner> {
    inner: &'a Mutex<I>,
    armed: bool,
}

impl<'a, I: TxInner> RollbackOnDrop<'a, I> {
    fn new(inner: &'a Mutex<I>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<I: TxInner> Drop for RollbackOnDrop<'_, I> {
    fn drop(&mut self) {
        if self.armed {
            *self.inner.lock().state_mut() = TxState::RolledBack;
        }
    }
}

/// Sends `write` as one conditional commit and turns a refused precondition
/// into [`StoreError::Conflict`].
///
/// The caller has already marked its transaction `Committed`. It stays that
/// way only if the backend applied the write; an error, a refused
/// precondition or a dropped future leaves it `RolledBack`.
pub(crate) async fn commit_guarded<I: TxInner>(
    backend: &dyn Backend,
    kind: StructureKind,
    key: &str,
    write: &ConditionalWrite,
    inner: &Mutex<I>,
) -> Result<()> {
    let guard = RollbackOnDrop::new(inner);
    match backend.commit_if_unchanged(key, write).await {
        Ok(true) => {
            guard.disarm();
            tracing::debug!(%kind, key, ops = write.op_count(), "transaction committed");
            Ok(())
        }
        Ok(false) => {
            tracing::warn!(%kind, key, "commit rejected: concurrent modification");
            Err(StoreError::Conflict {
                key: key.to_string(),
            })
        }
        Err(err) => {
            tracing::warn!(%kind, key, error = %err, "commit failed");
            Err(err)
        }
    }
}
