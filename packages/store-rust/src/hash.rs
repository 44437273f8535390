//! Field-map store: field name to value mapping bound to one backend key.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kvtx_core::overlay::{materialize_fields, overlay_field};
use kvtx_core::{FieldOp, HashOp, Result, StorageData, StoreError, StructureKind, TxState};
use parking_lot::Mutex;

use crate::backend::{deadline_after, Backend, ConditionalWrite};
use crate::commit::{commit_guarded, TxInner};

fn decode_all<T: StorageData>(fields: &BTreeMap<String, Vec<u8>>) -> Result<BTreeMap<String, T>> {
    fields
        .iter()
        .map(|(field, payload)| -> Result<(String, T)> {
            Ok((field.clone(), T::decode(payload)?))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HashStore
// ---------------------------------------------------------------------------

/// Named field map whose direct calls are applied immediately.
pub struct HashStore<T> {
    backend: Arc<dyn Backend>,
    key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T: StorageData> HashStore<T> {
    pub(crate) fn new(backend: Arc<dyn Backend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            _payload: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Writes one field.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if `value` does not encode, or the
    /// backend error.
    pub async fn set(&self, field: &str, value: &T) -> Result<()> {
        let payload = value.encode()?;
        self.backend.hset(&self.key, field, &payload).await
    }

    /// Reads one field.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the field is absent,
    /// [`StoreError::Serialization`] if its payload does not decode.
    pub async fn get(&self, field: &str) -> Result<T> {
        match self.backend.hget(&self.key, field).await? {
            Some(payload) => Ok(T::decode(&payload)?),
            None => Err(StoreError::field_not_found(&self.key, field)),
        }
    }

    /// Every field. A never-written map yields an empty result.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if any payload does not decode, or the
    /// backend error.
    pub async fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let fields = self.backend.hget_all(&self.key).await?;
        decode_all(&fields)
    }

    /// Removes `fields`. Missing fields and an empty list are fine.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn delete(&self, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.backend.hdel(&self.key, fields).await
    }

    /// Schedules the whole field map for removal at `at`; `false` if it is
    /// empty. Field writes keep the deadline.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn expire_at(&self, at: SystemTime) -> Result<bool> {
        self.backend.expire_at(&self.key, at).await
    }

    /// [`Self::expire_at`] `ttl` from now.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] if `ttl` overflows the clock, otherwise
    /// the backend error.
    pub async fn expire(&self, ttl: Duration) -> Result<bool> {
        self.expire_at(deadline_after(ttl)?).await
    }

    /// Opens a transaction over a copy of every field.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the snapshot cannot be read.
    pub async fn begin_tx(&self) -> Result<HashTransaction<T>> {
        let snapshot = self.backend.hget_all(&self.key).await?;
        Ok(HashTransaction {
            backend: Arc::clone(&self.backend),
            key: self.key.clone(),
            inner: Mutex::new(HashTxInner {
                state: TxState::Open,
                snapshot,
                log: Vec::new(),
            }),
            _payload: PhantomData,
        })
    }
}

// ---------------------------------------------------------------------------
// HashTransaction
// ---------------------------------------------------------------------------

struct HashTxInner {
    state: TxState,
    snapshot: BTreeMap<String, Vec<u8>>,
    log: Vec<HashOp>,
}

impl TxInner for HashTxInner {
    fn state_mut(&mut self) -> &mut TxState {
        &mut self.state
    }
}

/// Buffered view over a [`HashStore`].
///
/// Reads replay the log over the snapshot. Commit applies the whole log as
/// one batch, only if no field of the map changed since begin.
pub struct HashTransaction<T> {
    backend: Arc<dyn Backend>,
    key: String,
    inner: Mutex<HashTxInner>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: StorageData> HashTransaction<T> {
    /// Buffers a field write.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if `value` does not encode.
    pub fn set(&self, field: &str, value: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        let value = value.encode()?;
        inner.log.push(FieldOp::Set {
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    /// Latest buffered write of `field`, else its snapshot value.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::NotFound`] if the field is absent or deleted.
    pub fn get(&self, field: &str) -> Result<T> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        match overlay_field(&inner.snapshot, &inner.log, field) {
            Some(payload) => Ok(T::decode(payload)?),
            None => Err(StoreError::field_not_found(&self.key, field)),
        }
    }

    /// Snapshot with every buffered operation applied in order.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if a payload does not decode.
    pub fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        decode_all(&materialize_fields(&inner.snapshot, &inner.log))
    }

    /// Buffers one delete per field.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn delete(&self, fields: &[&str]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        inner.log.extend(fields.iter().map(|field| FieldOp::Delete {
            field: (*field).to_string(),
        }));
        Ok(())
    }

    /// Applies the log atomically if the map still equals the snapshot.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyFinished`] if already committed or rolled back.
    /// - [`StoreError::Conflict`] if any field changed; nothing was applied.
    /// - The backend error if the commit could not be sent.
    pub async fn commit(&self) -> Result<()> {
        let write = {
            let mut inner = self.inner.lock();
            inner.state.finish(TxState::Committed)?;
            if inner.log.is_empty() {
                return Ok(());
            }
            ConditionalWrite::Hash {
                expected: std::mem::take(&mut inner.snapshot),
                ops: std::mem::take(&mut inner.log),
            }
        };
        commit_guarded(
            self.backend.as_ref(),
            StructureKind::Hash,
            &self.key,
            &write,
            &self.inner,
        )
        .await
    }

    /// Discards the log.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] if already committed or rolled back.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.finish(TxState::RolledBack)?;
        inner.log.clear();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn store(backend: &Arc<MemoryBackend>) -> HashStore<String> {
        HashStore::new(Arc::clone(backend) as Arc<dyn Backend>, "players")
    }

    fn owned(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn direct_set_get_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let hash = store(&backend);
        assert!(hash.get_all().await.unwrap().is_empty());

        hash.set("a", &"1".to_string()).await.unwrap();
        hash.set("b", &"2".to_string()).await.unwrap();
        assert_eq!(hash.get("a").await.unwrap(), "1");
        assert_eq!(hash.get_all().await.unwrap(), owned(&[("a", "1"), ("b", "2")]));

        hash.delete(&["a"]).await.unwrap();
        hash.delete(&[]).await.unwrap();
        assert!(matches!(hash.get("a").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn transaction_overlay_follows_log_order() {
        let backend = Arc::new(MemoryBackend::new());
        let hash = store(&backend);
        hash.set("keep", &"k".to_string()).await.unwrap();
        hash.set("gone", &"g".to_string()).await.unwrap();

        let tx = hash.begin_tx().await.unwrap();
        tx.set("new", &"n1".to_string()).unwrap();
        tx.set("new", &"n2".to_string()).unwrap();
        tx.delete(&["gone"]).unwrap();
        tx.set("late", &"x".to_string()).unwrap();
        tx.delete(&["late"]).unwrap();

        assert_eq!(tx.get("new").unwrap(), "n2");
        assert!(matches!(tx.get("gone"), Err(StoreError::NotFound(_))));
        assert!(matches!(tx.get("late"), Err(StoreError::NotFound(_))));
        assert_eq!(tx.get_all().unwrap(), owned(&[("keep", "k"), ("new", "n2")]));

        // Nothing reaches the backend before commit.
        assert_eq!(hash.get_all().await.unwrap(), owned(&[("gone", "g"), ("keep", "k")]));

        tx.commit().await.unwrap();
        assert_eq!(hash.get_all().await.unwrap(), owned(&[("keep", "k"), ("new", "n2")]));
    }

    #[tokio::test]
    async fn unrelated_field_change_still_conflicts() {
        let backend = Arc::new(MemoryBackend::new());
        let hash = store(&backend);
        hash.set("a", &"1".to_string()).await.unwrap();

        let tx = hash.begin_tx().await.unwrap();
        tx.set("b", &"2".to_string()).unwrap();
        hash.set("c", &"3".to_string()).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(tx.state(), TxState::RolledBack);
        assert!(matches!(hash.get("b").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rollback_leaves_backend_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        let hash = store(&backend);
        hash.set("a", &"1".to_string()).await.unwrap();

        let tx = hash.begin_tx().await.unwrap();
        tx.delete(&["a"]).unwrap();
        tx.rollback().unwrap();

        assert_eq!(hash.get_all().await.unwrap(), owned(&[("a", "1")]));
        assert!(matches!(tx.get_all(), Err(StoreError::AlreadyFinished)));
    }
}
