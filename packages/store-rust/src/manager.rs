//! Registry of named stores sharing one backend connection.
//!
//! Each structure kind has its own name space. A name is registered once
//! with a value type and from then on resolves to the same shared store
//! handle; lookups with another value type fail instead of aliasing the
//! payloads.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kvtx_core::{Result, ScoredData, StorageData, StoreError, StructureKind};

use crate::backend::{Backend, DeadlineBackend, RedisBackend};
use crate::config::ManagerConfig;
use crate::hash::HashStore;
use crate::kv::KvStore;
use crate::memory_hash::MemoryHash;
use crate::zset::SortedSetStore;

type Registry = DashMap<String, Arc<dyn Any + Send + Sync>>;

fn register<S: Any + Send + Sync>(
    registry: &Registry,
    kind: StructureKind,
    name: &str,
    make: impl FnOnce() -> S,
) -> Result<Arc<S>> {
    match registry.entry(name.to_string()) {
        Entry::Occupied(_) => Err(StoreError::DuplicateRegistration {
            kind,
            name: name.to_string(),
        }),
        Entry::Vacant(vacant) => {
            let store = Arc::new(make());
            vacant.insert(Arc::clone(&store) as Arc<dyn Any + Send + Sync>);
            tracing::debug!(%kind, name, "storage registered");
            Ok(store)
        }
    }
}

fn lookup<S: Any + Send + Sync>(
    registry: &Registry,
    kind: StructureKind,
    name: &str,
) -> Result<Arc<S>> {
    let handle = registry
        .get(name)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| StoreError::NotFound(format!("{kind} storage not found: {name}")))?;
    handle.downcast::<S>().map_err(|_| StoreError::TypeMismatch {
        kind,
        name: name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, names and hands out stores over one shared backend.
///
/// There is no process-wide instance: build one with [`Manager::connect`]
/// or [`Manager::with_backend`] and pass it (usually in an `Arc`) to the code
/// that needs it.
pub struct Manager {
    backend: Arc<dyn Backend>,
    kvs: Registry,
    hashes: Registry,
    sorted_sets: Registry,
    memory_hashes: Registry,
    closed: AtomicBool,
}

impl Manager {
    /// Connects to the Redis deployment described by `config`.
    ///
    /// The connection is verified with a ping inside the connect timeout.
    /// When `operation_timeout_ms` is positive, every later backend call is
    /// bounded by it.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] for an invalid `config`.
    /// - [`StoreError::Timeout`] if connecting or the ping takes too long.
    /// - [`StoreError::BackendUnavailable`] / [`StoreError::Backend`] if the
    ///   deployment refuses the connection.
    pub async fn connect(config: &ManagerConfig) -> Result<Self> {
        let redis = RedisBackend::connect(config).await?;
        match tokio::time::timeout(config.connect_timeout(), redis.ping()).await {
            Ok(ping) => ping?,
            Err(_elapsed) => {
                return Err(StoreError::Timeout {
                    timeout_ms: config.connect_timeout_ms,
                })
            }
        }

        let backend: Arc<dyn Backend> = match config.operation_timeout() {
            Some(timeout) => Arc::new(DeadlineBackend::new(Arc::new(redis), timeout)),
            None => Arc::new(redis),
        };
        Ok(Self::with_backend(backend))
    }

    /// Builds a manager over an existing backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            kvs: DashMap::new(),
            hashes: DashMap::new(),
            sorted_sets: DashMap::new(),
            memory_hashes: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    // --- Registration ---

    /// Registers a scalar store under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateRegistration`] if `name` is already a scalar
    /// store; the existing registration is untouched.
    pub fn register_kv<T: StorageData>(&self, name: &str) -> Result<Arc<KvStore<T>>> {
        register(&self.kvs, StructureKind::Kv, name, || {
            KvStore::new(Arc::clone(&self.backend), name)
        })
    }

    /// Registers a field-map store under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateRegistration`] if `name` is already a field map.
    pub fn register_hash<T: StorageData>(&self, name: &str) -> Result<Arc<HashStore<T>>> {
        register(&self.hashes, StructureKind::Hash, name, || {
            HashStore::new(Arc::clone(&self.backend), name)
        })
    }

    /// Registers a sorted-set store under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateRegistration`] if `name` is already a sorted set.
    pub fn register_sorted_set<T: ScoredData>(
        &self,
        name: &str,
    ) -> Result<Arc<SortedSetStore<T>>> {
        register(&self.sorted_sets, StructureKind::SortedSet, name, || {
            SortedSetStore::new(Arc::clone(&self.backend), name)
        })
    }

    /// Registers a process-local field map under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateRegistration`] if `name` is already a memory
    /// hash.
    pub fn register_memory_hash<T: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<MemoryHash<T>>> {
        register(&self.memory_hashes, StructureKind::MemoryHash, name, || {
            MemoryHash::new(name)
        })
    }

    // --- Lookup ---

    /// # Errors
    ///
    /// [`StoreError::NotFound`] if unregistered, [`StoreError::TypeMismatch`]
    /// if registered with another value type.
    pub fn kv<T: StorageData>(&self, name: &str) -> Result<Arc<KvStore<T>>> {
        lookup(&self.kvs, StructureKind::Kv, name)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] if unregistered, [`StoreError::TypeMismatch`]
    /// if registered with another value type.
    pub fn hash<T: StorageData>(&self, name: &str) -> Result<Arc<HashStore<T>>> {
        lookup(&self.hashes, StructureKind::Hash, name)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] if unregistered, [`StoreError::TypeMismatch`]
    /// if registered with another value type.
    pub fn sorted_set<T: ScoredData>(&self, name: &str) -> Result<Arc<SortedSetStore<T>>> {
        lookup(&self.sorted_sets, StructureKind::SortedSet, name)
    }

    /// # Errors
    ///
    /// [`StoreError::NotFound`] if unregistered, [`StoreError::TypeMismatch`]
    /// if registered with another value type.
    pub fn memory_hash<T: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<MemoryHash<T>>> {
        lookup(&self.memory_hashes, StructureKind::MemoryHash, name)
    }

    // --- Lifecycle ---

    /// Round-trips to the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend error, [`StoreError::BackendUnavailable`] after
    /// [`close`](Self::close).
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Releases the backend connection. Only the first call does anything.
    ///
    /// Stores and open transactions stay valid as values, but their backend
    /// calls fail with [`StoreError::BackendUnavailable`] from now on.
    ///
    /// # Errors
    ///
    /// Returns the backend error if releasing the connection fails.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close().await?;
        tracing::info!(
            kv = self.kvs.len(),
            hash = self.hashes.len(),
            sorted_set = self.sorted_sets.len(),
            memory_hash = self.memory_hashes.len(),
            "storage manager closed"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
