//! In-process [`Backend`] implementation backed by [`DashMap`].
//!
//! Mirrors the Redis data model (one typed structure per key, empty hashes
//! and sorted sets disappear) closely enough to stand in for a live server
//! in tests and in single-process deployments. Each call holds the key's
//! shard lock for its whole duration, which makes every call, including
//! [`Backend::commit_if_unchanged`], atomic per key.
//!
//! Expiry follows Redis: a deadline is checked lazily whenever its key is
//! touched, overwriting a scalar clears it, and field or member writes keep
//! it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kvtx_core::overlay::{
    apply_field_ops, apply_zset_ops, rank_window, rev_range_by_score, sorted_members,
};
use kvtx_core::{Result, ScoredMember, StoreError};

use super::{Backend, ConditionalWrite};

/// Structure stored under one key.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    SortedSet(BTreeMap<Vec<u8>, f64>),
}

impl Slot {
    fn is_empty(&self) -> bool {
        match self {
            Self::Value(_) => false,
            Self::Hash(fields) => fields.is_empty(),
            Self::SortedSet(members) => members.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key `{key}` holding the wrong kind of value"
    ))
}

/// In-memory backend for concurrent access without a server.
pub struct MemoryBackend {
    entries: DashMap<String, Slot>,
    deadlines: DashMap<String, SystemTime>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates a new, empty `MemoryBackend`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            deadlines: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently present. Expired keys not yet touched
    /// since their deadline still count.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Fails once closed, otherwise drops `key` if its deadline has passed.
    fn open_key(&self, key: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::BackendUnavailable("connection closed".to_string()));
        }
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|at| *at <= SystemTime::now());
        if expired {
            self.deadlines.remove(key);
            self.entries.remove(key);
        }
        Ok(())
    }

    /// Removes `key` along with its deadline.
    fn forget(&self, key: &str) {
        self.entries.remove(key);
        self.deadlines.remove(key);
    }

    fn sorted(&self, key: &str) -> Result<Vec<ScoredMember>> {
        match self.entries.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Slot::SortedSet(members)) => Ok(sorted_members(
                members.iter().map(|(m, s)| (m.clone(), *s)),
            )),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `current` still equals the snapshot carried by `write`.
fn snapshot_matches(key: &str, current: Option<&Slot>, write: &ConditionalWrite) -> Result<bool> {
    let matches = match (write, current) {
        (ConditionalWrite::Value { expected, .. }, None) => expected.is_none(),
        (ConditionalWrite::Value { expected, .. }, Some(Slot::Value(value))) => {
            expected.as_deref() == Some(value.as_slice())
        }
        (ConditionalWrite::Hash { expected, .. }, None) => expected.is_empty(),
        (ConditionalWrite::Hash { expected, .. }, Some(Slot::Hash(fields))) => expected == fields,
        (ConditionalWrite::SortedSet { expected, .. }, None) => expected.is_empty(),
        (ConditionalWrite::SortedSet { expected, .. }, Some(Slot::SortedSet(members))) => {
            expected.len() == members.len()
                && expected.iter().all(|m| {
                    members
                        .get(&m.member)
                        .is_some_and(|score| score.to_bits() == m.score.to_bits())
                })
        }
        (_, Some(_)) => return Err(wrong_type(key)),
    };
    Ok(matches)
}

/// Applies the writes of `write` on top of `current`. `None` means the key
/// ends up absent.
fn apply_write(current: Option<Slot>, write: &ConditionalWrite) -> Option<Slot> {
    let next = match write {
        ConditionalWrite::Value { value, .. } => Slot::Value(value.clone()),
        ConditionalWrite::Hash { ops, .. } => {
            let mut fields = match current {
                Some(Slot::Hash(fields)) => fields,
                _ => BTreeMap::new(),
            };
            apply_field_ops(&mut fields, ops.iter().cloned());
            Slot::Hash(fields)
        }
        ConditionalWrite::SortedSet { ops, .. } => {
            let mut members = match current {
                Some(Slot::SortedSet(members)) => members,
                _ => BTreeMap::new(),
            };
            apply_zset_ops(&mut members, ops);
            Slot::SortedSet(members)
        }
    };
    (!next.is_empty()).then_some(next)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.open_key(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(None),
            Some(Slot::Value(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.open_key(key)?;
        self.entries.insert(key.to_string(), Slot::Value(value.to_vec()));
        self.deadlines.remove(key);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.open_key(key)?;
        self.forget(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.open_key(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(None),
            Some(Slot::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.open_key(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(BTreeMap::new()),
            Some(Slot::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.open_key(key)?;
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::Hash(BTreeMap::new()));
        match slot.value_mut() {
            Slot::Hash(fields) => {
                fields.insert(field.to_string(), value.to_vec());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        self.open_key(key)?;
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) {
            let Slot::Hash(map) = occupied.get_mut() else {
                return Err(wrong_type(key));
            };
            for field in fields {
                map.remove(*field);
            }
            if map.is_empty() {
                occupied.remove();
                self.deadlines.remove(key);
            }
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()> {
        self.open_key(key)?;
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::SortedSet(BTreeMap::new()));
        match slot.value_mut() {
            Slot::SortedSet(members) => {
                members.insert(member.to_vec(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<()> {
        self.open_key(key)?;
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) {
            let Slot::SortedSet(members) = occupied.get_mut() else {
                return Err(wrong_type(key));
            };
            members.remove(member);
            if members.is_empty() {
                occupied.remove();
                self.deadlines.remove(key);
            }
        }
        Ok(())
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>> {
        self.open_key(key)?;
        let sorted = self.sorted(key)?;
        Ok(match rank_window(sorted.len(), start, stop) {
            Some(range) => sorted[range].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<ScoredMember>> {
        self.open_key(key)?;
        let sorted = self.sorted(key)?;
        Ok(rev_range_by_score(&sorted, max, min, offset, count))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.open_key(key)?;
        match self.entries.get(key).as_deref() {
            None => Ok(0),
            Some(Slot::SortedSet(members)) => Ok(members.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.open_key(key)?;
        if let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) {
            let Slot::SortedSet(members) = occupied.get_mut() else {
                return Err(wrong_type(key));
            };
            let sorted = sorted_members(members.iter().map(|(m, s)| (m.clone(), *s)));
            if let Some(range) = rank_window(sorted.len(), start, stop) {
                for doomed in &sorted[range] {
                    members.remove(&doomed.member);
                }
            }
            if members.is_empty() {
                occupied.remove();
                self.deadlines.remove(key);
            }
        }
        Ok(())
    }

    async fn commit_if_unchanged(&self, key: &str, write: &ConditionalWrite) -> Result<bool> {
        self.open_key(key)?;
        let entry = self.entries.entry(key.to_string());
        let current = match &entry {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(_) => None,
        };
        if !snapshot_matches(key, current.as_ref(), write)? {
            return Ok(false);
        }
        match (entry, apply_write(current, write)) {
            (Entry::Occupied(mut occupied), Some(next)) => {
                occupied.insert(next);
            }
            (Entry::Occupied(occupied), None) => {
                occupied.remove();
                self.deadlines.remove(key);
            }
            (Entry::Vacant(vacant), Some(next)) => {
                vacant.insert(next);
            }
            (Entry::Vacant(_), None) => {}
        }
        // A scalar commit is a plain SET on Redis, which drops the TTL.
        if matches!(write, ConditionalWrite::Value { .. }) {
            self.deadlines.remove(key);
        }
        Ok(true)
    }

    async fn expire_at(&self, key: &str, at: SystemTime) -> Result<bool> {
        self.open_key(key)?;
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        if at <= SystemTime::now() {
            self.forget(key);
        } else {
            self.deadlines.insert(key.to_string(), at);
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::BackendUnavailable("connection closed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
