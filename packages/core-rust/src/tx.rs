//! Transaction lifecycle.
//!
//! State machine: Open -> Committed | RolledBack. Both terminal states are
//! final; every call made after reaching one fails with
//! [`StoreError::AlreadyFinished`].

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    /// Accepting buffered reads and writes.
    #[default]
    Open,
    /// Commit was called. A commit that fails moves on to `RolledBack`.
    Committed,
    /// Rolled back explicitly, or the commit was rejected.
    RolledBack,
}

impl TxState {
    /// Fails with [`StoreError::AlreadyFinished`] unless the state is `Open`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyFinished`] for either terminal state.
    pub fn ensure_open(self) -> Result<()> {
        match self {
            Self::Open => Ok(()),
            Self::Committed | Self::RolledBack => Err(StoreError::AlreadyFinished),
        }
    }

    #[must_use]
    pub fn is_finished(self) -> bool {
        self != Self::Open
    }

    /// Moves an open transaction into `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyFinished`] if the transaction was already
    /// finished; the state is left unchanged in that case.
    pub fn finish(&mut self, next: TxState) -> Result<()> {
        self.ensure_open()?;
        *self = next;
        Ok(())
    }
}
