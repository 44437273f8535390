//! Timeout decorator for backends.
//!
//! Bounds every call on the wrapped [`Backend`] with a fixed deadline and
//! rejects calls that exceed it with [`StoreError::Timeout`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kvtx_core::{Result, ScoredMember, StoreError};

use super::{Backend, ConditionalWrite};

// ---------------------------------------------------------------------------
// DeadlineBackend
// ---------------------------------------------------------------------------

/// Backend wrapper that enforces a per-call timeout.
///
/// A conditional commit that times out may still have been applied by the
/// server; the caller only learns that the outcome is unknown.
pub struct DeadlineBackend {
    inner: Arc<dyn Backend>,
    timeout: Duration,
}

impl DeadlineBackend {
    #[must_use]
    pub fn new(inner: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T: Send>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StoreError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl Backend for DeadlineBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.bounded(self.inner.set(key, value)).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.bounded(self.inner.del(key)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.bounded(self.inner.hget(key, field)).await
    }

    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.bounded(self.inner.hget_all(key)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.bounded(self.inner.hset(key, field, value)).await
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        self.bounded(self.inner.hdel(key, fields)).await
    }

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()> {
        self.bounded(self.inner.zadd(key, member, score)).await
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<()> {
        self.bounded(self.inner.zrem(key, member)).await
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>> {
        self.bounded(self.inner.zrange_with_scores(key, start, stop)).await
    }

    async fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<ScoredMember>> {
        self.bounded(self.inner.zrev_range_by_score(key, max, min, offset, count))
            .await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.bounded(self.inner.zcard(key)).await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.bounded(self.inner.zrem_range_by_rank(key, start, stop)).await
    }

    async fn expire_at(&self, key: &str, at: SystemTime) -> Result<bool> {
        self.bounded(self.inner.expire_at(key, at)).await
    }

    async fn commit_if_unchanged(&self, key: &str, write: &ConditionalWrite) -> Result<bool> {
        self.bounded(self.inner.commit_if_unchanged(key, write)).await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded(self.inner.ping()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
