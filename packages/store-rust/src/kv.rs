//! Scalar store: one opaque value bound to one backend key.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kvtx_core::{Result, StorageData, StoreError, StructureKind, TxState};
use parking_lot::Mutex;

use crate::backend::{deadline_after, Backend, ConditionalWrite};
use crate::commit::{commit_guarded, TxInner};

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Named scalar whose direct calls are applied immediately, last writer wins.
pub struct KvStore<T> {
    backend: Arc<dyn Backend>,
    key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T: StorageData> KvStore<T> {
    pub(crate) fn new(backend: Arc<dyn Backend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            _payload: PhantomData,
        }
    }

    /// Registration name, also the backend key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Writes `value` unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if `value` does not encode, or
    /// the backend error.
    pub async fn set(&self, value: &T) -> Result<()> {
        let payload = value.encode()?;
        self.backend.set(&self.key, &payload).await
    }

    /// Reads and decodes the current value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key was never written (or was
    /// deleted), [`StoreError::Serialization`] if the payload does not decode.
    pub async fn get(&self) -> Result<T> {
        match self.backend.get(&self.key).await? {
            Some(payload) => Ok(T::decode(&payload)?),
            None => Err(StoreError::key_not_found(&self.key)),
        }
    }

    /// Removes the value. Deleting an absent value succeeds.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn delete(&self) -> Result<()> {
        self.backend.del(&self.key).await
    }

    /// Schedules the value for removal at `at`. A past instant removes it
    /// now.
    ///
    /// Returns `false` if there is nothing stored to expire. A later `set` or
    /// committed transaction clears the deadline.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn expire_at(&self, at: SystemTime) -> Result<bool> {
        self.backend.expire_at(&self.key, at).await
    }

    /// Schedules the value for removal `ttl` from now.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] if `ttl` overflows the clock, otherwise
    /// the backend error.
    pub async fn expire(&self, ttl: Duration) -> Result<bool> {
        self.expire_at(deadline_after(ttl)?).await
    }

    /// Opens a transaction over the current value.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the snapshot cannot be read.
    pub async fn begin_tx(&self) -> Result<KvTransaction<T>> {
        let snapshot = self.backend.get(&self.key).await?;
        Ok(KvTransaction {
            backend: Arc::clone(&self.backend),
            key: self.key.clone(),
            inner: Mutex::new(KvTxInner {
                state: TxState::Open,
                snapshot,
                pending: None,
            }),
            _payload: PhantomData,
        })
    }
}

// ---------------------------------------------------------------------------
// KvTransaction
// ---------------------------------------------------------------------------

struct KvTxInner {
    state: TxState,
    /// Raw payload at begin; `None` when the key was absent.
    snapshot: Option<Vec<u8>>,
    /// Latest buffered write. Earlier writes are irrelevant.
    pending: Option<Vec<u8>>,
}

impl TxInner for KvTxInner {
    fn state_mut(&mut self) -> &mut TxState {
        &mut self.state
    }
}

/// Buffered view over a [`KvStore`] value.
///
/// Commit is a compare-and-set: the buffered value is written only if the
/// backend still holds the snapshot bytes (or is still absent).
pub struct KvTransaction<T> {
    backend: Arc<dyn Backend>,
    key: String,
    inner: Mutex<KvTxInner>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: StorageData> KvTransaction<T> {
    /// Buffers `value`, replacing any earlier buffered write.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if `value` does not encode.
    pub fn set(&self, value: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        inner.pending = Some(value.encode()?);
        Ok(())
    }

    /// Buffered write if any, else the snapshot.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::NotFound`] if neither exists.
    pub fn get(&self) -> Result<T> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        match inner.pending.as_ref().or(inner.snapshot.as_ref()) {
            Some(payload) => Ok(T::decode(payload)?),
            None => Err(StoreError::key_not_found(&self.key)),
        }
    }

    /// Applies the buffered write if the value is unchanged since begin.
    ///
    /// A transaction with nothing buffered commits without touching the
    /// backend. Either way the transaction is finished afterwards.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyFinished`] if already committed or rolled back.
    /// - [`StoreError::Conflict`] if the value changed; nothing was written.
    /// - The backend error if the commit could not be sent.
    pub async fn commit(&self) -> Result<()> {
        let write = {
            let mut inner = self.inner.lock();
            inner.state.finish(TxState::Committed)?;
            let Some(value) = inner.pending.take() else {
                return Ok(());
            };
            ConditionalWrite::Value {
                expected: inner.snapshot.take(),
                value,
            }
        };
        commit_guarded(
            self.backend.as_ref(),
            StructureKind::Kv,
            &self.key,
            &write,
            &self.inner,
        )
        .await
    }

    /// Discards the buffered write.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] if already committed or rolled back.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.finish(TxState::RolledBack)?;
        inner.pending = None;
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }
}
