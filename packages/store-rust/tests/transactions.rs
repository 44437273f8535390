//! End-to-end behaviour of the stores through a [`Manager`] over the
//! in-process backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kvtx_store::{
    Backend, DeadlineBackend, Manager, MemoryBackend, Packed, Scored, StoreError, TxState,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Purchase {
    order_id: String,
    amount_cents: u64,
}

fn purchase(order_id: &str, amount_cents: u64) -> Packed<Purchase> {
    Packed(Purchase {
        order_id: order_id.to_string(),
        amount_cents,
    })
}

type Rank = Scored<String>;

fn rank(player: &str, score: f64) -> Rank {
    Scored::new(player.to_string(), score)
}

fn players(entries: &[Rank]) -> Vec<&str> {
    entries.iter().map(|e| e.value.as_str()).collect()
}

fn manager() -> Manager {
    Manager::with_backend(Arc::new(MemoryBackend::new()))
}

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kv_last_committer_before_conflict_wins() {
    let manager = manager();
    let kv = manager.register_kv::<Packed<Purchase>>("last_purchase").unwrap();
    kv.set(&purchase("o-0", 100)).await.unwrap();

    let t1 = kv.begin_tx().await.unwrap();
    let t2 = kv.begin_tx().await.unwrap();
    t1.set(&purchase("o-1", 250)).unwrap();
    t2.set(&purchase("o-2", 999)).unwrap();

    t1.commit().await.unwrap();
    let err = t2.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { ref key } if key == "last_purchase"));

    assert_eq!(kv.get().await.unwrap(), purchase("o-1", 250));
    assert_eq!(t2.state(), TxState::RolledBack);
}

#[tokio::test]
async fn kv_conflict_when_key_created_concurrently() {
    let manager = manager();
    let kv = manager.register_kv::<String>("flag").unwrap();

    let tx = kv.begin_tx().await.unwrap();
    assert!(matches!(tx.get(), Err(StoreError::NotFound(_))));
    tx.set(&"mine".to_string()).unwrap();

    kv.set(&"theirs".to_string()).await.unwrap();
    assert!(tx.commit().await.unwrap_err().is_conflict());
    assert_eq!(kv.get().await.unwrap(), "theirs");
}

// ---------------------------------------------------------------------------
// Field map
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hash_read_your_writes_without_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = Manager::with_backend(Arc::clone(&backend) as Arc<dyn Backend>);
    let hash = manager.register_hash::<Packed<Purchase>>("daily").unwrap();
    hash.set("u1", &purchase("o-1", 10)).await.unwrap();

    let tx = hash.begin_tx().await.unwrap();
    // Reads inside the transaction are served from the snapshot and log.
    backend.close().await.unwrap();
    tx.set("u2", &purchase("o-2", 20)).unwrap();
    tx.delete(&["u1"]).unwrap();

    assert_eq!(tx.get("u2").unwrap(), purchase("o-2", 20));
    assert!(matches!(tx.get("u1"), Err(StoreError::NotFound(_))));
    assert_eq!(tx.get_all().unwrap().len(), 1);

    assert!(tx.commit().await.unwrap_err().is_backend_unavailable());
}

#[tokio::test]
async fn hash_conflict_applies_nothing() {
    let manager = manager();
    let hash = manager.register_hash::<String>("limits").unwrap();
    hash.set("a", &"1".to_string()).await.unwrap();

    let t1 = hash.begin_tx().await.unwrap();
    let t2 = hash.begin_tx().await.unwrap();
    t1.set("a", &"2".to_string()).unwrap();
    t2.set("b", &"x".to_string()).unwrap();
    t2.delete(&["a"]).unwrap();

    t1.commit().await.unwrap();
    assert!(t2.commit().await.unwrap_err().is_conflict());

    let all = hash.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["a"], "2");
}

// ---------------------------------------------------------------------------
// Sorted set
// ---------------------------------------------------------------------------

async fn leaderboard(manager: &Manager, name: &str) -> Arc<kvtx_store::SortedSetStore<Rank>> {
    let zset = manager.register_sorted_set::<Rank>(name).unwrap();
    for (player, score) in [("p100", 100.0), ("p50", 50.0), ("p200", 200.0)] {
        zset.add(&rank(player, score)).await.unwrap();
    }
    zset
}

#[tokio::test]
async fn zset_ranges_and_trims() {
    let manager = manager();
    let zset = leaderboard(&manager, "board").await;

    let all = zset.range(0, -1).await.unwrap();
    assert_eq!(all.iter().map(|r| r.score).collect::<Vec<_>>(), [50.0, 100.0, 200.0]);
    assert!(zset.range(10, 20).await.unwrap().is_empty());
    assert_eq!(players(&zset.range(-100, 100).await.unwrap()), ["p50", "p100", "p200"]);

    zset.trim_to_top_n(2).await.unwrap();
    assert_eq!(players(&zset.range(0, -1).await.unwrap()), ["p50", "p100"]);

    let high = leaderboard(&manager, "board-high").await;
    high.rev_trim_to_top_n(2).await.unwrap();
    assert_eq!(players(&high.range(0, -1).await.unwrap()), ["p100", "p200"]);
}

#[tokio::test]
async fn zset_transaction_view_matches_backend_after_commit() {
    let manager = manager();
    let zset = leaderboard(&manager, "board").await;

    let tx = zset.begin_tx().await.unwrap();
    tx.add(&rank("p75", 75.0)).unwrap();
    tx.remove(&rank("p200", 0.0)).unwrap();
    tx.add(&rank("p50", 500.0)).unwrap();

    let view = tx.range(0, -1).unwrap();
    assert_eq!(players(&view), ["p75", "p100", "p50"]);
    let top = tx.rev_range_by_score(f64::INFINITY, f64::NEG_INFINITY, 0, 2).unwrap();
    assert_eq!(players(&top), ["p50", "p100"]);

    tx.commit().await.unwrap();
    assert_eq!(zset.range(0, -1).await.unwrap(), view);
    assert_eq!(zset.len().await.unwrap(), 3);
}

#[tokio::test]
async fn zset_rev_range_edge_counts() {
    let manager = manager();
    let zset = leaderboard(&manager, "board").await;

    assert!(zset.rev_range_by_score(1e9, 0.0, 0, 0).await.unwrap().is_empty());
    assert_eq!(zset.rev_range_by_score(1e9, 0.0, -5, -1).await.unwrap().len(), 3);
    assert!(zset.rev_range_by_score(1e9, 0.0, 10, -1).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rollback_leaves_backend_unchanged() {
    let manager = manager();
    let zset = leaderboard(&manager, "board").await;

    let tx = zset.begin_tx().await.unwrap();
    tx.trim_to_top_n(0).unwrap();
    assert!(tx.range(0, -1).unwrap().is_empty());
    tx.rollback().unwrap();

    assert_eq!(zset.len().await.unwrap(), 3);
    assert!(matches!(tx.range(0, -1), Err(StoreError::AlreadyFinished)));
    assert!(matches!(tx.commit().await, Err(StoreError::AlreadyFinished)));
}

#[tokio::test]
async fn duplicate_registration_keeps_first_usable() {
    let manager = manager();
    let first = manager.register_kv::<String>("session").unwrap();
    first.set(&"alive".to_string()).await.unwrap();

    let err = manager.register_kv::<String>("session").err().unwrap();
    assert!(matches!(err, StoreError::DuplicateRegistration { .. }));

    let looked_up = manager.kv::<String>("session").unwrap();
    assert_eq!(looked_up.get().await.unwrap(), "alive");
}

#[tokio::test]
async fn memory_hash_commits_without_conflict_detection() {
    let manager = manager();
    let sessions = manager.register_memory_hash::<Vec<u32>>("sessions").unwrap();
    sessions.set("u1", &vec![1, 2]);

    let tx = sessions.begin_tx();
    tx.set("u1", &vec![3]).unwrap();
    sessions.set("u1", &vec![9]);
    tx.commit().unwrap();

    let same = manager.memory_hash::<Vec<u32>>("sessions").unwrap();
    assert_eq!(same.get("u1").unwrap(), vec![3]);
}

#[tokio::test]
async fn closed_manager_fails_calls_promptly() {
    let manager = manager();
    let hash = manager.register_hash::<String>("h").unwrap();
    let tx = hash.begin_tx().await.unwrap();
    tx.set("f", &"v".to_string()).unwrap();

    manager.close().await.unwrap();
    manager.close().await.unwrap();

    assert!(hash.get_all().await.unwrap_err().is_backend_unavailable());
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)));
}

#[tokio::test]
async fn hash_and_zset_expire_as_a_whole() {
    let manager = manager();
    let hash = manager.register_hash::<String>("cooldowns").unwrap();
    assert!(!hash.expire(Duration::from_secs(60)).await.unwrap());
    hash.set("u1", &"x".to_string()).await.unwrap();
    assert!(hash.expire(Duration::from_millis(300)).await.unwrap());
    // Field writes keep the deadline.
    hash.set("u2", &"y".to_string()).await.unwrap();

    let zset = leaderboard(&manager, "weekly").await;
    assert!(zset.expire_at(SystemTime::now() + Duration::from_millis(300)).await.unwrap());
    assert_eq!(zset.len().await.unwrap(), 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(hash.get_all().await.unwrap().is_empty());
    assert_eq!(zset.len().await.unwrap(), 0);
}

/// Which calls never answer.
#[derive(Clone, Copy)]
enum Stall {
    Reads,
    Commits,
}

/// Backend that stalls one kind of call, used to observe deadlines and
/// cancelled commits.
struct Unresponsive {
    inner: MemoryBackend,
    stall: Stall,
}

impl Unresponsive {
    fn new(stall: Stall) -> Self {
        Self {
            inner: MemoryBackend::new(),
            stall,
        }
    }
}

async fn hang() {
    tokio::time::sleep(Duration::from_secs(3600)).await;
}

#[async_trait::async_trait]
impl Backend for Unresponsive {
    async fn get(&self, key: &str) -> kvtx_store::Result<Option<Vec<u8>>> {
        if matches!(self.stall, Stall::Reads) {
            hang().await;
        }
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &[u8]) -> kvtx_store::Result<()> {
        self.inner.set(key, value).await
    }
    async fn del(&self, key: &str) -> kvtx_store::Result<()> {
        self.inner.del(key).await
    }
    async fn hget(&self, key: &str, field: &str) -> kvtx_store::Result<Option<Vec<u8>>> {
        self.inner.hget(key, field).await
    }
    async fn hget_all(
        &self,
        key: &str,
    ) -> kvtx_store::Result<std::collections::BTreeMap<String, Vec<u8>>> {
        self.inner.hget_all(key).await
    }
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> kvtx_store::Result<()> {
        self.inner.hset(key, field, value).await
    }
    async fn hdel(&self, key: &str, fields: &[&str]) -> kvtx_store::Result<()> {
        self.inner.hdel(key, fields).await
    }
    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> kvtx_store::Result<()> {
        self.inner.zadd(key, member, score).await
    }
    async fn zrem(&self, key: &str, member: &[u8]) -> kvtx_store::Result<()> {
        self.inner.zrem(key, member).await
    }
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> kvtx_store::Result<Vec<kvtx_core::ScoredMember>> {
        self.inner.zrange_with_scores(key, start, stop).await
    }
    async fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> kvtx_store::Result<Vec<kvtx_core::ScoredMember>> {
        self.inner.zrev_range_by_score(key, max, min, offset, count).await
    }
    async fn zcard(&self, key: &str) -> kvtx_store::Result<u64> {
        self.inner.zcard(key).await
    }
    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> kvtx_store::Result<()> {
        self.inner.zrem_range_by_rank(key, start, stop).await
    }
    async fn commit_if_unchanged(
        &self,
        key: &str,
        write: &kvtx_store::ConditionalWrite,
    ) -> kvtx_store::Result<bool> {
        if matches!(self.stall, Stall::Commits) {
            hang().await;
        }
        self.inner.commit_if_unchanged(key, write).await
    }
    async fn expire_at(&self, key: &str, at: SystemTime) -> kvtx_store::Result<bool> {
        self.inner.expire_at(key, at).await
    }
    async fn ping(&self) -> kvtx_store::Result<()> {
        self.inner.ping().await
    }
    async fn close(&self) -> kvtx_store::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_surfaces_as_timeout() {
    let slow: Arc<dyn Backend> = Arc::new(Unresponsive::new(Stall::Reads));
    let bounded = Arc::new(DeadlineBackend::new(slow, Duration::from_millis(200)));
    let manager = Manager::with_backend(bounded);
    let kv = manager.register_kv::<String>("slow").unwrap();

    let err = kv.get().await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout { timeout_ms: 200 }));
    assert!(err.is_backend_unavailable());

    // Other calls still go through.
    kv.set(&"fast".to_string()).await.unwrap();
    manager.ping().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_commit_leaves_transaction_rolled_back() {
    let manager = Manager::with_backend(Arc::new(Unresponsive::new(Stall::Commits)));
    let kv = manager.register_kv::<String>("flag").unwrap();
    let hash = manager.register_hash::<String>("limits").unwrap();
    let zset = manager.register_sorted_set::<Rank>("board").unwrap();

    let kv_tx = kv.begin_tx().await.unwrap();
    kv_tx.set(&"on".to_string()).unwrap();
    let cancelled = tokio::time::timeout(Duration::from_millis(50), kv_tx.commit()).await;
    assert!(cancelled.is_err());
    assert_eq!(kv_tx.state(), TxState::RolledBack);
    assert!(matches!(kv.get().await, Err(StoreError::NotFound(_))));
    assert!(matches!(kv_tx.commit().await, Err(StoreError::AlreadyFinished)));

    let hash_tx = hash.begin_tx().await.unwrap();
    hash_tx.set("a", &"1".to_string()).unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), hash_tx.commit())
        .await
        .is_err());
    assert_eq!(hash_tx.state(), TxState::RolledBack);
    assert!(hash.get_all().await.unwrap().is_empty());

    let zset_tx = zset.begin_tx().await.unwrap();
    zset_tx.add(&rank("p1", 1.0)).unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), zset_tx.commit())
        .await
        .is_err());
    assert_eq!(zset_tx.state(), TxState::RolledBack);
    assert_eq!(zset.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn commit_timeout_rolls_back() {
    let stalled: Arc<dyn Backend> = Arc::new(Unresponsive::new(Stall::Commits));
    let manager = Manager::with_backend(Arc::new(DeadlineBackend::new(
        stalled,
        Duration::from_millis(100),
    )));
    let kv = manager.register_kv::<String>("flag").unwrap();

    let tx = kv.begin_tx().await.unwrap();
    tx.set(&"on".to_string()).unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout { timeout_ms: 100 }));
    assert_eq!(tx.state(), TxState::RolledBack);
}
