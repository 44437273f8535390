//! Error taxonomy shared by every store and backend.
//!
//! All fallible operations in `kvtx` return [`StoreError`]. Nothing in the
//! library retries: a [`StoreError::Conflict`] is handed back to the caller,
//! which is expected to start a fresh transaction and replay its writes.

use std::fmt;

/// Structure families. Each kind has its own registration name space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureKind {
    /// Single opaque value bound to one key.
    Kv,
    /// Field name to value mapping bound to one key.
    Hash,
    /// Score-ordered set of unique members bound to one key.
    SortedSet,
    /// Process-local field map that never touches the backend.
    MemoryHash,
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Kv => "KV",
            Self::Hash => "Hash",
            Self::SortedSet => "SortedSet",
            Self::MemoryHash => "MemoryHash",
        };
        f.write_str(label)
    }
}

/// Failure to turn a value into payload bytes or back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Errors returned by stores, transactions, backends and the manager.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key, field or registration does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Commit found the backing structure changed since the snapshot.
    #[error("transaction conflict: key `{key}` was modified by another client")]
    Conflict { key: String },

    /// A call was made on a transaction after commit or rollback.
    #[error("transaction already finished")]
    AlreadyFinished,

    #[error("{kind} storage already registered: {name}")]
    DuplicateRegistration { kind: StructureKind, name: String },

    #[error("{kind} storage `{name}` was registered with a different value type")]
    TypeMismatch { kind: StructureKind, name: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),

    /// Connection, IO or closed-connection failure talking to the backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The backend answered but rejected the command.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Shorthand for a missing field inside a named structure.
    #[must_use]
    pub fn field_not_found(key: &str, field: &str) -> Self {
        Self::NotFound(format!("field `{field}` in `{key}`"))
    }

    /// Shorthand for a missing key.
    #[must_use]
    pub fn key_not_found(key: &str) -> Self {
        Self::NotFound(format!("key `{key}`"))
    }

    /// `true` for [`StoreError::Conflict`]; the only error worth a replay.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// `true` when the backend could not be reached in time.
    #[must_use]
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout { .. })
    }
}

/// Result alias used across `kvtx`.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
