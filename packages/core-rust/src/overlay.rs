//! Operation logs and snapshot overlays.
//!
//! A transaction never writes through to its structure before commit.
//! Instead it keeps an immutable snapshot plus an ordered log of write
//! intents, and answers reads by replaying the log over the snapshot. This
//! module holds that replay logic together with the rank and score windowing
//! used by sorted-set reads, so the backend-facing stores, the in-process
//! backend and the in-memory store all agree on the same semantics.

use std::collections::BTreeMap;
use std::ops::Range;

/// Write intent against a field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOp<V> {
    Set { field: String, value: V },
    Delete { field: String },
}

impl<V> FieldOp<V> {
    /// Field this operation targets.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Set { field, .. } | Self::Delete { field } => field,
        }
    }
}

/// Field-map operation carrying an encoded payload.
pub type HashOp = FieldOp<Vec<u8>>;

/// Resolves one field against a snapshot and an operation log.
///
/// The last operation on `field` wins; with no operation the snapshot value
/// is returned. A trailing delete makes the field absent.
pub fn overlay_field<'a, V>(
    snapshot: &'a BTreeMap<String, V>,
    ops: &'a [FieldOp<V>],
    field: &str,
) -> Option<&'a V> {
    match ops.iter().rev().find(|op| op.field() == field) {
        Some(FieldOp::Set { value, .. }) => Some(value),
        Some(FieldOp::Delete { .. }) => None,
        None => snapshot.get(field),
    }
}

/// Applies an operation log, in order, to a copy of the snapshot.
#[must_use]
pub fn materialize_fields<V: Clone>(
    snapshot: &BTreeMap<String, V>,
    ops: &[FieldOp<V>],
) -> BTreeMap<String, V> {
    let mut merged = snapshot.clone();
    apply_field_ops(&mut merged, ops.iter().cloned());
    merged
}

/// Applies field operations in order to a live map.
pub fn apply_field_ops<V>(target: &mut BTreeMap<String, V>, ops: impl IntoIterator<Item = FieldOp<V>>) {
    for op in ops {
        match op {
            FieldOp::Set { field, value } => {
                target.insert(field, value);
            }
            FieldOp::Delete { field } => {
                target.remove(&field);
            }
        }
    }
}

/// Sorted-set member: encoded payload plus score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: Vec<u8>,
    pub score: f64,
}

impl ScoredMember {
    #[must_use]
    pub fn new(member: Vec<u8>, score: f64) -> Self {
        Self { member, score }
    }
}

/// Write intent against a sorted set. Identity is the member payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ZSetOp {
    /// Insert the member, or replace its score if already present.
    Add(ScoredMember),
    Remove(Vec<u8>),
}

/// Applies sorted-set operations in order to a member → score map.
pub fn apply_zset_ops<'a>(
    target: &mut BTreeMap<Vec<u8>, f64>,
    ops: impl IntoIterator<Item = &'a ZSetOp>,
) {
    for op in ops {
        match op {
            ZSetOp::Add(m) => {
                target.insert(m.member.clone(), m.score);
            }
            ZSetOp::Remove(member) => {
                target.remove(member);
            }
        }
    }
}

/// Orders members ascending by score, ties broken by payload bytes.
///
/// This is the order a Redis sorted set reports, which keeps transaction
/// views and backend reads consistent with each other.
#[must_use]
pub fn sorted_members(members: impl IntoIterator<Item = (Vec<u8>, f64)>) -> Vec<ScoredMember> {
    let mut out: Vec<ScoredMember> = members
        .into_iter()
        .map(|(member, score)| ScoredMember { member, score })
        .collect();
    out.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
    out
}

/// Replays `ops` over `snapshot` and returns the effective members in
/// ascending order.
#[must_use]
pub fn materialize_zset(snapshot: &[ScoredMember], ops: &[ZSetOp]) -> Vec<ScoredMember> {
    let mut members: BTreeMap<Vec<u8>, f64> = snapshot
        .iter()
        .map(|m| (m.member.clone(), m.score))
        .collect();
    apply_zset_ops(&mut members, ops);
    sorted_members(members)
}

/// Resolves inclusive `[start, stop]` ranks over `len` items.
///
/// Negative ranks count from the end (`-1` is the last item). Out-of-range
/// bounds are clamped; `None` means the window is empty.
#[must_use]
pub fn rank_window(len: usize, start: i64, stop: i64) -> Option<Range<usize>> {
    let total = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if start < 0 { start + total } else { start }.max(0);
    let stop = if stop < 0 { stop + total } else { stop }.min(total - 1);
    if start > stop {
        return None;
    }
    let start = usize::try_from(start).ok()?;
    let stop = usize::try_from(stop).ok()?;
    Some(start..stop + 1)
}

/// Slice of `sorted` selected by inclusive ranks, see [`rank_window`].
#[must_use]
pub fn rank_slice(sorted: &[ScoredMember], start: i64, stop: i64) -> &[ScoredMember] {
    match rank_window(sorted.len(), start, stop) {
        Some(range) => &sorted[range],
        None => &[],
    }
}

/// Members with `min <= score <= max`, highest score first, paginated.
///
/// `sorted` must be ascending (as produced by [`sorted_members`]). A
/// negative `offset` counts as 0, a negative `count` returns everything
/// after the offset.
#[must_use]
pub fn rev_range_by_score(
    sorted: &[ScoredMember],
    max: f64,
    min: f64,
    offset: i64,
    count: i64,
) -> Vec<ScoredMember> {
    let skip = usize::try_from(offset).unwrap_or(0);
    let take = usize::try_from(count).unwrap_or(usize::MAX);
    sorted
        .iter()
        .rev()
        .filter(|m| m.score >= min && m.score <= max)
        .skip(skip)
        .take(take)
        .cloned()
        .collect()
}

/// Members that fall outside the `n` lowest scores.
#[must_use]
pub fn beyond_lowest(sorted: &[ScoredMember], n: usize) -> &[ScoredMember] {
    sorted.get(n..).unwrap_or(&[])
}

/// Members that fall outside the `n` highest scores.
#[must_use]
pub fn beyond_highest(sorted: &[ScoredMember], n: usize) -> &[ScoredMember] {
    &sorted[..sorted.len().saturating_sub(n)]
}
