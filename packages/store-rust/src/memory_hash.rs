//! Process-local field map that never touches the backend.
//!
//! Values are held as `T` and cloned in and out, so callers never alias the
//! stored state. Transactions buffer against a snapshot like the backend
//! stores do, but commit applies unconditionally under the write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use kvtx_core::overlay::{apply_field_ops, materialize_fields, overlay_field};
use kvtx_core::{FieldOp, Result, StoreError, TxState};
use parking_lot::{Mutex, RwLock};

/// In-memory field map shared through `Arc`.
pub struct MemoryHash<T> {
    name: String,
    entries: Arc<RwLock<BTreeMap<String, T>>>,
}

impl<T: Clone + Send + Sync + 'static> MemoryHash<T> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, field: &str, value: &T) {
        self.entries.write().insert(field.to_string(), value.clone());
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the field is absent.
    pub fn get(&self, field: &str) -> Result<T> {
        self.entries
            .read()
            .get(field)
            .cloned()
            .ok_or_else(|| StoreError::field_not_found(&self.name, field))
    }

    #[must_use]
    pub fn get_all(&self) -> BTreeMap<String, T> {
        self.entries.read().clone()
    }

    pub fn delete(&self, fields: &[&str]) {
        let mut entries = self.entries.write();
        for field in fields {
            entries.remove(*field);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Opens a transaction over a copy of the current map.
    #[must_use]
    pub fn begin_tx(&self) -> MemoryHashTransaction<T> {
        let snapshot = self.entries.read().clone();
        MemoryHashTransaction {
            name: self.name.clone(),
            entries: Arc::clone(&self.entries),
            inner: Mutex::new(MemoryTxInner {
                state: TxState::Open,
                snapshot,
                log: Vec::new(),
            }),
        }
    }
}

struct MemoryTxInner<T> {
    state: TxState,
    snapshot: BTreeMap<String, T>,
    log: Vec<FieldOp<T>>,
}

/// Buffered view over a [`MemoryHash`]. Commit never conflicts.
pub struct MemoryHashTransaction<T> {
    name: String,
    entries: Arc<RwLock<BTreeMap<String, T>>>,
    inner: Mutex<MemoryTxInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> MemoryHashTransaction<T> {
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn set(&self, field: &str, value: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        inner.log.push(FieldOp::Set {
            field: field.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::NotFound`] if the field is absent or deleted.
    pub fn get(&self, field: &str) -> Result<T> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        overlay_field(&inner.snapshot, &inner.log, field)
            .cloned()
            .ok_or_else(|| StoreError::field_not_found(&self.name, field))
    }

    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        Ok(materialize_fields(&inner.snapshot, &inner.log))
    }

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

    /// Applies the log to the live map. Writes made by others since begin
    /// are overwritten field by field.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] if already committed or rolled back.
    pub fn commit(&self) -> Result<()> {
        let log = {
            let mut inner = self.inner.lock();
            inner.state.finish(TxState::Committed)?;
            std::mem::take(&mut inner.log)
        };
        if !log.is_empty() {
            let mut entries = self.entries.write();
            apply_field_ops(&mut *entries, log);
        }
        Ok(())
    }

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
