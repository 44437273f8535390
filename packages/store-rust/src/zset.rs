//! Ordered-set store: score-ordered unique members bound to one backend key.
//!
//! Members are identified by their encoded payload; the score travels beside
//! it. Ordering is ascending by score with ties broken by payload bytes,
//! which is also the order Redis reports, so transaction views and direct
//! reads agree.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kvtx_core::overlay::{
    beyond_highest, beyond_lowest, materialize_zset, rank_slice, rev_range_by_score,
};
use kvtx_core::{Result, ScoredData, ScoredMember, StoreError, StructureKind, TxState, ZSetOp};
use parking_lot::Mutex;

use crate::backend::{deadline_after, Backend, ConditionalWrite};
use crate::commit::{commit_guarded, TxInner};

fn decode_member<T: ScoredData>(member: &ScoredMember) -> Result<T> {
    let mut value = T::decode(&member.member)?;
    value.set_score(member.score);
    Ok(value)
}

fn decode_members<T: ScoredData>(members: &[ScoredMember]) -> Result<Vec<T>> {
    members.iter().map(decode_member::<T>).collect()
}

fn rank(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// SortedSetStore
// ---------------------------------------------------------------------------

/// Named sorted set whose direct calls are applied immediately.
pub struct SortedSetStore<T> {
    backend: Arc<dyn Backend>,
    key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T: ScoredData> SortedSetStore<T> {
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

    /// Inserts `element`, or moves it to its new score if already present.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if `element` does not encode, or the
    /// backend error.
    pub async fn add(&self, element: &T) -> Result<()> {
        let member = element.encode()?;
        self.backend.zadd(&self.key, &member, element.score()).await
    }

    /// Removes the member whose payload equals `element`'s. The score is
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if `element` does not encode, or the
    /// backend error.
    pub async fn remove(&self, element: &T) -> Result<()> {
        let member = element.encode()?;
        self.backend.zrem(&self.key, &member).await
    }

    /// Members by inclusive rank, lowest score first. Negative ranks count
    /// from the end and out-of-range ranks are clamped.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if a payload does not decode, or the
    /// backend error.
    pub async fn range(&self, start: i64, stop: i64) -> Result<Vec<T>> {
        let members = self.backend.zrange_with_scores(&self.key, start, stop).await?;
        decode_members(&members)
    }

    /// Members with `min <= score <= max`, highest first, skipping `offset`
    /// and returning at most `count` (negative for all).
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if a payload does not decode, or the
    /// backend error.
    pub async fn rev_range_by_score(
        &self,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .backend
            .zrev_range_by_score(&self.key, max, min, offset, count)
            .await?;
        decode_members(&members)
    }

    /// Keeps the `n` lowest-score members.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn trim_to_top_n(&self, n: usize) -> Result<()> {
        self.backend.zrem_range_by_rank(&self.key, rank(n), -1).await
    }

    /// Keeps the `n` highest-score members.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn rev_trim_to_top_n(&self, n: usize) -> Result<()> {
        let stop = rank(n).saturating_add(1).saturating_neg();
        self.backend.zrem_range_by_rank(&self.key, 0, stop).await
    }

    /// Number of members.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn len(&self) -> Result<u64> {
        self.backend.zcard(&self.key).await
    }

    /// Schedules the whole sorted set for removal at `at`; `false` if it is
    /// empty. Member writes keep the deadline.
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

    /// Opens a transaction over every member and its score.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the snapshot cannot be read.
    pub async fn begin_tx(&self) -> Result<SortedSetTransaction<T>> {
        let snapshot = self.backend.zrange_with_scores(&self.key, 0, -1).await?;
        Ok(SortedSetTransaction {
            backend: Arc::clone(&self.backend),
            key: self.key.clone(),
            inner: Mutex::new(ZSetTxInner {
                state: TxState::Open,
                snapshot,
                log: Vec::new(),
            }),
            _payload: PhantomData,
        })
    }
}

// ---------------------------------------------------------------------------
// SortedSetTransaction
// ---------------------------------------------------------------------------

struct ZSetTxInner {
    state: TxState,
    snapshot: Vec<ScoredMember>,
    log: Vec<ZSetOp>,
}

impl TxInner for ZSetTxInner {
    fn state_mut(&mut self) -> &mut TxState {
        &mut self.state
    }
}

impl ZSetTxInner {
    fn view(&self) -> Vec<ScoredMember> {
        materialize_zset(&self.snapshot, &self.log)
    }

    fn remove_all(&mut self, doomed: &[ScoredMember]) {
        self.log
            .extend(doomed.iter().map(|m| ZSetOp::Remove(m.member.clone())));
    }
}

/// Buffered view over a [`SortedSetStore`].
///
/// Reads and trims operate on the snapshot with the log replayed over it.
/// Commit applies the log as one batch, only if no member or score changed
/// since begin.
pub struct SortedSetTransaction<T> {
    backend: Arc<dyn Backend>,
    key: String,
    inner: Mutex<ZSetTxInner>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: ScoredData> SortedSetTransaction<T> {
    /// Buffers an insert or score update.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if `element` does not encode.
    pub fn add(&self, element: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        let member = element.encode()?;
        inner
            .log
            .push(ZSetOp::Add(ScoredMember::new(member, element.score())));
        Ok(())
    }

    /// Buffers a removal.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if `element` does not encode.
    pub fn remove(&self, element: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        let member = element.encode()?;
        inner.log.push(ZSetOp::Remove(member));
        Ok(())
    }

    /// Inclusive rank window over the buffered view.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if a payload does not decode.
    pub fn range(&self, start: i64, stop: i64) -> Result<Vec<T>> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        let view = inner.view();
        decode_members(rank_slice(&view, start, stop))
    }

    /// Descending score window over the buffered view.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback,
    /// [`StoreError::Serialization`] if a payload does not decode.
    pub fn rev_range_by_score(
        &self,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<T>> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        let view = inner.view();
        decode_members(&rev_range_by_score(&view, max, min, offset, count))
    }

    /// Buffers removal of every member outside the `n` lowest scores.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn trim_to_top_n(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        let view = inner.view();
        inner.remove_all(beyond_lowest(&view, n));
        Ok(())
    }

    /// Buffers removal of every member outside the `n` highest scores.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn rev_trim_to_top_n(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_open()?;
        let view = inner.view();
        inner.remove_all(beyond_highest(&view, n));
        Ok(())
    }

    /// Number of members in the buffered view.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyFinished`] after commit or rollback.
    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.lock();
        inner.state.ensure_open()?;
        Ok(inner.view().len())
    }

    /// Applies the log atomically if the set still equals the snapshot.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyFinished`] if already committed or rolled back.
    /// - [`StoreError::Conflict`] if any member or score changed; nothing was
    ///   applied.
    /// - The backend error if the commit could not be sent.
    pub async fn commit(&self) -> Result<()> {
        let write = {
            let mut inner = self.inner.lock();
            inner.state.finish(TxState::Committed)?;
            if inner.log.is_empty() {
                return Ok(());
            }
            ConditionalWrite::SortedSet {
                expected: std::mem::take(&mut inner.snapshot),
                ops: std::mem::take(&mut inner.log),
            }
        };
        commit_guarded(
            self.backend.as_ref(),
            StructureKind::SortedSet,
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
