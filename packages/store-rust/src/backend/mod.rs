//! Backend contract consumed by every networked store.
//!
//! [`Backend`] is the minimal surface the stores need from a Redis-like
//! service: scalar, hash and sorted-set primitives, a cardinality query, key
//! expiry, a health check, and [`Backend::commit_if_unchanged`], the
//! conditional-commit primitive transactions are built on.
//!
//! Implementations:
//! - [`RedisBackend`]: standalone, sentinel and cluster topologies
//! - [`MemoryBackend`]: in-process, used for tests and single-process setups
//! - [`DeadlineBackend`]: decorator bounding every call with a timeout

pub mod deadline;
pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kvtx_core::{HashOp, Result, ScoredMember, StoreError, ZSetOp};

pub use self::deadline::DeadlineBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Guarded batch for [`Backend::commit_if_unchanged`].
///
/// Each variant pairs the snapshot the transaction read with the writes to
/// apply. The backend applies the writes, in order, only if the live
/// structure still equals the snapshot; otherwise it applies nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalWrite {
    /// Compare-and-set of a scalar. `None` means the key must be absent.
    Value {
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    },
    /// Field-map batch guarded by the full field → payload snapshot.
    Hash {
        expected: BTreeMap<String, Vec<u8>>,
        ops: Vec<HashOp>,
    },
    /// Sorted-set batch guarded by the full member → score snapshot.
    SortedSet {
        expected: Vec<ScoredMember>,
        ops: Vec<ZSetOp>,
    },
}

impl ConditionalWrite {
    /// Number of write operations carried by the batch.
    #[must_use]
    pub fn op_count(&self) -> usize {
        match self {
            Self::Value { .. } => 1,
            Self::Hash { ops, .. } => ops.len(),
            Self::SortedSet { ops, .. } => ops.len(),
        }
    }
}

/// Networked key-value service the stores run against.
///
/// Every method may block on IO and is cancelled by dropping its future.
/// Each call is atomic at the backend. Used as `Arc<dyn Backend>`, shared by
/// all stores of one [`Manager`](crate::Manager).
#[async_trait]
pub trait Backend: Send + Sync {
    // --- Scalar ---

    /// Read a scalar value, `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a scalar value unconditionally.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a key of any kind. Deleting a missing key succeeds.
    async fn del(&self, key: &str) -> Result<()>;

    // --- Hash ---

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Vec<u8>>>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;

    /// Delete fields. Missing fields are ignored.
    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()>;

    // --- Sorted set ---

    /// Insert a member or update its score.
    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()>;

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<()>;

    /// Members by inclusive rank, ascending score. Negative ranks count
    /// from the end.
    async fn zrange_with_scores(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<ScoredMember>>;

    /// Members with `min <= score <= max`, descending, skipping `offset`
    /// and returning at most `count` (negative `count` returns all).
    async fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<ScoredMember>>;

    /// Number of members, 0 when the key does not exist.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Remove members by inclusive rank range.
    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    // --- Expiry ---

    /// Schedule `key` for removal at `at`, replacing any earlier deadline.
    /// A deadline already in the past removes the key now.
    ///
    /// Returns `Ok(false)` when the key does not exist.
    async fn expire_at(&self, key: &str, at: SystemTime) -> Result<bool>;

    // --- Conditional commit ---

    /// Atomically apply `write` if the structure at `key` still matches its
    /// snapshot.
    ///
    /// Returns `Ok(true)` when applied and `Ok(false)` when the snapshot no
    /// longer matches (nothing applied).
    async fn commit_if_unchanged(&self, key: &str, write: &ConditionalWrite) -> Result<bool>;

    // --- Lifecycle ---

    /// Round-trip health check.
    async fn ping(&self) -> Result<()>;

    /// Release the connection. Later calls fail with
    /// [`StoreError::BackendUnavailable`](kvtx_core::StoreError::BackendUnavailable).
    /// Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Absolute deadline `ttl` from now.
pub(crate) fn deadline_after(ttl: Duration) -> Result<SystemTime> {
    SystemTime::now()
        .checked_add(ttl)
        .ok_or_else(|| StoreError::InvalidConfig(format!("expiry {ttl:?} is out of range")))
}

/// Milliseconds since the Unix epoch, 0 for earlier instants.
pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_clamps_before_epoch() {
        assert_eq!(unix_millis(SystemTime::UNIX_EPOCH), 0);
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(unix_millis(before), 0);
        let later = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(unix_millis(later), 1_700_000_000_123);
    }

    #[test]
    fn deadline_after_rejects_overflow() {
        assert!(deadline_after(Duration::from_secs(60)).unwrap() > SystemTime::now());
        assert!(matches!(
            deadline_after(Duration::MAX),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
