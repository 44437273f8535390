//! [`Backend`] over a live Redis deployment.
//!
//! One [`RedisBackend`] owns the deployment's connection, which is shared by
//! every store of a manager. Standalone and cluster connections multiplex
//! and reconnect on their own. Sentinel deployments cache a connection to
//! the discovered primary and drop it after any connection-class or
//! `READONLY` error, so the next call asks the sentinels again.
//!
//! Conditional commits run as Lua scripts. Each script re-reads the whole
//! structure, compares it with the transaction's snapshot, and applies the
//! batch only on a match, all inside a single server-side step.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use ::redis::aio::{ConnectionLike, MultiplexedConnection};
use ::redis::cluster::ClusterClientBuilder;
use ::redis::cluster_async::ClusterConnection;
use ::redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use ::redis::{
    Client, Cmd, ConnectionAddr, ConnectionInfo, ErrorKind, FromRedisValue, Pipeline,
    RedisConnectionInfo, RedisError, RedisFuture, Script, ScriptInvocation, Value,
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use kvtx_core::{FieldOp, Result, ScoredMember, StoreError, ZSetOp};

use super::{unix_millis, Backend, ConditionalWrite};
use crate::config::{ManagerConfig, Topology};

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// ARGV: has-expected flag ('1' / '0'), expected payload, new payload.
const VALUE_CAS: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

/// ARGV: n, n field/payload pairs, then ops: 'set' field payload | 'del' field.
const HASH_CAS: &str = r"
local n = tonumber(ARGV[1])
local live = redis.call('HGETALL', KEYS[1])
if #live ~= 2 * n then return 0 end
local current = {}
for i = 1, #live, 2 do current[live[i]] = live[i + 1] end
local pos = 2
for _ = 1, n do
  if current[ARGV[pos]] ~= ARGV[pos + 1] then return 0 end
  pos = pos + 2
end
while pos <= #ARGV do
  if ARGV[pos] == 'set' then
    redis.call('HSET', KEYS[1], ARGV[pos + 1], ARGV[pos + 2])
    pos = pos + 3
  else
    redis.call('HDEL', KEYS[1], ARGV[pos + 1])
    pos = pos + 2
  end
end
return 1
";

/// ARGV: n, n member/score pairs, then ops: 'add' score member | 'rem' member.
const ZSET_CAS: &str = r"
local function num(s)
  if s == 'inf' or s == '+inf' then return math.huge end
  if s == '-inf' then return -math.huge end
  return tonumber(s)
end
local n = tonumber(ARGV[1])
local live = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
if #live ~= 2 * n then return 0 end
local current = {}
for i = 1, #live, 2 do current[live[i]] = num(live[i + 1]) end
local pos = 2
for _ = 1, n do
  if current[ARGV[pos]] ~= num(ARGV[pos + 1]) then return 0 end
  pos = pos + 2
end
while pos <= #ARGV do
  if ARGV[pos] == 'add' then
    redis.call('ZADD', KEYS[1], ARGV[pos + 1], ARGV[pos + 2])
    pos = pos + 3
  else
    redis.call('ZREM', KEYS[1], ARGV[pos + 1])
    pos = pos + 2
  end
end
return 1
";

/// Score as a Redis argument. Infinities use the spelling Redis accepts.
fn score_arg(score: f64) -> String {
    if score.is_infinite() {
        if score.is_sign_positive() { "+inf" } else { "-inf" }.to_string()
    } else {
        score.to_string()
    }
}

/// Positional ARGV for the CAS script matching `write`.
fn cas_args(write: &ConditionalWrite) -> Vec<Vec<u8>> {
    let mut args: Vec<Vec<u8>> = Vec::new();
    match write {
        ConditionalWrite::Value { expected, value } => {
            match expected {
                Some(expected) => args.extend([b"1".to_vec(), expected.clone()]),
                None => args.extend([b"0".to_vec(), Vec::new()]),
            }
            args.push(value.clone());
        }
        ConditionalWrite::Hash { expected, ops } => {
            args.push(expected.len().to_string().into_bytes());
            for (field, payload) in expected {
                args.extend([field.as_bytes().to_vec(), payload.clone()]);
            }
            for op in ops {
                match op {
                    FieldOp::Set { field, value } => {
                        args.extend([b"set".to_vec(), field.as_bytes().to_vec(), value.clone()]);
                    }
                    FieldOp::Delete { field } => {
                        args.extend([b"del".to_vec(), field.as_bytes().to_vec()]);
                    }
                }
            }
        }
        ConditionalWrite::SortedSet { expected, ops } => {
            args.push(expected.len().to_string().into_bytes());
            for m in expected {
                args.extend([m.member.clone(), score_arg(m.score).into_bytes()]);
            }
            for op in ops {
                match op {
                    ZSetOp::Add(m) => args.extend([
                        b"add".to_vec(),
                        score_arg(m.score).into_bytes(),
                        m.member.clone(),
                    ]),
                    ZSetOp::Remove(member) => args.extend([b"rem".to_vec(), member.clone()]),
                }
            }
        }
    }
    args
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Cached primary connection of a sentinel-managed deployment.
struct SentinelLink {
    client: tokio::sync::Mutex<SentinelClient>,
    primary: ArcSwapOption<MultiplexedConnection>,
}

impl SentinelLink {
    async fn primary(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.primary.load_full() {
            return Ok((*conn).clone());
        }
        let mut client = self.client.lock().await;
        // Another caller may have finished discovery while we waited.
        if let Some(conn) = self.primary.load_full() {
            return Ok((*conn).clone());
        }
        let conn = client.get_async_connection().await.map_err(backend_error)?;
        tracing::info!("sentinel primary discovered");
        self.primary.store(Some(Arc::new(conn.clone())));
        Ok(conn)
    }

    fn forget_primary(&self) {
        if self.primary.swap(None).is_some() {
            tracing::warn!("sentinel primary connection dropped, re-discovering on next call");
        }
    }
}

enum Link {
    Standalone(MultiplexedConnection),
    Sentinel(SentinelLink),
    Cluster(ClusterConnection),
}

/// Per-call connection handle, cheap to clone out of the shared [`Link`].
#[derive(Clone)]
enum Conn {
    Node(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Node(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Node(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Node(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

fn backend_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::BackendUnavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// Errors after which a sentinel deployment may have failed over.
fn signals_failover(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.kind() == ErrorKind::ReadOnly
}

fn node_info(addr: &str, redis: RedisConnectionInfo) -> Result<ConnectionInfo> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| StoreError::InvalidConfig(format!("address `{addr}` is not host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| StoreError::InvalidConfig(format!("address `{addr}` has an invalid port")))?;
    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis,
    })
}

// ---------------------------------------------------------------------------
// RedisBackend
// ---------------------------------------------------------------------------

/// Redis-backed [`Backend`] for standalone, sentinel and cluster deployments.
pub struct RedisBackend {
    link: ArcSwapOption<Link>,
    topology: Topology,
    value_cas: Script,
    hash_cas: Script,
    zset_cas: Script,
}

impl RedisBackend {
    /// Opens the connection described by `config` within its connect
    /// timeout.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] if `config` fails validation or holds a
    ///   malformed address.
    /// - [`StoreError::Timeout`] if the connection is not up in time.
    /// - [`StoreError::BackendUnavailable`] / [`StoreError::Backend`] if the
    ///   client refuses to connect.
    pub async fn connect(config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        let link = match tokio::time::timeout(config.connect_timeout(), open_link(config)).await {
            Ok(link) => link?,
            Err(_elapsed) => {
                return Err(StoreError::Timeout {
                    timeout_ms: config.connect_timeout_ms,
                })
            }
        };
        tracing::info!(mode = %config.mode, addrs = ?config.addrs, "redis backend connected");
        Ok(Self {
            link: ArcSwapOption::from_pointee(link),
            topology: config.mode,
            value_cas: Script::new(VALUE_CAS),
            hash_cas: Script::new(HASH_CAS),
            zset_cas: Script::new(ZSET_CAS),
        })
    }

    async fn connection(&self) -> Result<Conn> {
        let link = self
            .link
            .load_full()
            .ok_or_else(|| StoreError::BackendUnavailable("connection closed".to_string()))?;
        match link.as_ref() {
            Link::Standalone(conn) => Ok(Conn::Node(conn.clone())),
            Link::Cluster(conn) => Ok(Conn::Cluster(conn.clone())),
            Link::Sentinel(sentinel) => sentinel.primary().await.map(Conn::Node),
        }
    }

    fn fail(&self, err: RedisError) -> StoreError {
        if signals_failover(&err) {
            if let Some(link) = self.link.load_full() {
                if let Link::Sentinel(sentinel) = link.as_ref() {
                    sentinel.forget_primary();
                }
            }
        }
        backend_error(err)
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.connection().await?;
        let reply: T = cmd.query_async(&mut conn).await.map_err(|e| self.fail(e))?;
        Ok(reply)
    }

    async fn invoke(&self, invocation: &ScriptInvocation<'_>) -> Result<bool> {
        let mut conn = self.connection().await?;
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(applied == 1)
    }
}

async fn open_link(config: &ManagerConfig) -> Result<Link> {
    let redis_info = RedisConnectionInfo {
        db: config.db,
        password: config.password.clone(),
        ..RedisConnectionInfo::default()
    };
    match config.mode {
        Topology::Standalone => {
            let addr = config
                .addrs
                .first()
                .ok_or_else(|| {
                    StoreError::InvalidConfig("standalone mode requires one address".to_string())
                })?;
            let client = Client::open(node_info(addr, redis_info)?).map_err(backend_error)?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(backend_error)?;
            Ok(Link::Standalone(conn))
        }
        Topology::Sentinel => {
            let monitors = config
                .addrs
                .iter()
                .map(|addr| node_info(addr, RedisConnectionInfo::default()))
                .collect::<Result<Vec<_>>>()?;
            let master_name = config.master_name.clone().unwrap_or_default();
            let node = SentinelNodeConnectionInfo {
                redis_connection_info: Some(redis_info),
                ..SentinelNodeConnectionInfo::default()
            };
            let client =
                SentinelClient::build(monitors, master_name, Some(node), SentinelServerType::Master)
                    .map_err(backend_error)?;
            let link = SentinelLink {
                client: tokio::sync::Mutex::new(client),
                primary: ArcSwapOption::empty(),
            };
            link.primary().await?;
            Ok(Link::Sentinel(link))
        }
        Topology::Cluster => {
            let seeds = config
                .addrs
                .iter()
                .map(|addr| node_info(addr, RedisConnectionInfo::default()))
                .collect::<Result<Vec<_>>>()?;
            let mut builder = ClusterClientBuilder::new(seeds);
            if let Some(password) = &config.password {
                builder = builder.password(password.clone());
            }
            let client = builder.build().map_err(backend_error)?;
            let conn = client.get_async_connection().await.map_err(backend_error)?;
            Ok(Link::Cluster(conn))
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(::redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.query(::redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.query(::redis::cmd("DEL").arg(key)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.query(::redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.query(::redis::cmd("HGETALL").arg(key)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.query(::redis::cmd("HSET").arg(key).arg(field).arg(value)).await
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.query(::redis::cmd("HDEL").arg(key).arg(fields)).await
    }

    async fn zadd(&self, key: &str, member: &[u8], score: f64) -> Result<()> {
        self.query(::redis::cmd("ZADD").arg(key).arg(score_arg(score)).arg(member))
            .await
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<()> {
        self.query(::redis::cmd("ZREM").arg(key).arg(member)).await
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>> {
        let pairs: Vec<(Vec<u8>, f64)> = self
            .query(::redis::cmd("ZRANGE").arg(key).arg(start).arg(stop).arg("WITHSCORES"))
            .await?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    async fn zrev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: i64,
        count: i64,
    ) -> Result<Vec<ScoredMember>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let pairs: Vec<(Vec<u8>, f64)> = self
            .query(
                ::redis::cmd("ZREVRANGEBYSCORE")
                    .arg(key)
                    .arg(score_arg(max))
                    .arg(score_arg(min))
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(offset.max(0))
                    .arg(if count < 0 { -1 } else { count }),
            )
            .await?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember::new(member, score))
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.query(::redis::cmd("ZCARD").arg(key)).await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.query(::redis::cmd("ZREMRANGEBYRANK").arg(key).arg(start).arg(stop))
            .await
    }

    async fn expire_at(&self, key: &str, at: SystemTime) -> Result<bool> {
        let applied: i64 = self
            .query(::redis::cmd("PEXPIREAT").arg(key).arg(unix_millis(at)))
            .await?;
        Ok(applied == 1)
    }

    async fn commit_if_unchanged(&self, key: &str, write: &ConditionalWrite) -> Result<bool> {
        let script = match write {
            ConditionalWrite::Value { .. } => &self.value_cas,
            ConditionalWrite::Hash { .. } => &self.hash_cas,
            ConditionalWrite::SortedSet { .. } => &self.zset_cas,
        };
        let mut invocation = script.prepare_invoke();
        invocation.key(key);
        for arg in cas_args(write) {
            invocation.arg(arg);
        }
        self.invoke(&invocation).await
    }

    async fn ping(&self) -> Result<()> {
        let _pong: String = self.query(&::redis::cmd("PING")).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.link.swap(None).is_some() {
            tracing::info!(mode = %self.topology, "redis backend closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_arg_spells_infinities() {
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(1.5), "1.5");
        assert_eq!(score_arg(100.0), "100");
    }

    fn strings(args: &[Vec<u8>]) -> Vec<String> {
        args.iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    #[test]
    fn value_cas_args_flag_the_snapshot() {
        let present = ConditionalWrite::Value {
            expected: Some(b"old".to_vec()),
            value: b"new".to_vec(),
        };
        assert_eq!(strings(&cas_args(&present)), ["1", "old", "new"]);

        let absent = ConditionalWrite::Value {
            expected: None,
            value: b"new".to_vec(),
        };
        assert_eq!(strings(&cas_args(&absent)), ["0", "", "new"]);
    }

    #[test]
    fn hash_cas_args_list_snapshot_then_ops() {
        let write = ConditionalWrite::Hash {
            expected: BTreeMap::from([
                ("b".to_string(), b"2".to_vec()),
                ("a".to_string(), b"1".to_vec()),
            ]),
            ops: vec![
                FieldOp::Set {
                    field: "c".to_string(),
                    value: b"3".to_vec(),
                },
                FieldOp::Delete {
                    field: "a".to_string(),
                },
            ],
        };
        assert_eq!(
            strings(&cas_args(&write)),
            ["2", "a", "1", "b", "2", "set", "c", "3", "del", "a"]
        );
    }

    #[test]
    fn zset_cas_args_spell_scores_for_lua() {
        let write = ConditionalWrite::SortedSet {
            expected: vec![
                ScoredMember::new(b"low".to_vec(), f64::NEG_INFINITY),
                ScoredMember::new(b"mid".to_vec(), 2.5),
            ],
            ops: vec![
                ZSetOp::Add(ScoredMember::new(b"top".to_vec(), f64::INFINITY)),
                ZSetOp::Remove(b"mid".to_vec()),
            ],
        };
        assert_eq!(
            strings(&cas_args(&write)),
            ["2", "low", "-inf", "mid", "2.5", "add", "+inf", "top", "rem", "mid"]
        );
    }

    #[test]
    fn empty_snapshot_still_sends_count() {
        let write = ConditionalWrite::SortedSet {
            expected: Vec::new(),
            ops: vec![ZSetOp::Add(ScoredMember::new(b"m".to_vec(), 1.0))],
        };
        assert_eq!(strings(&cas_args(&write)), ["0", "add", "1", "m"]);
    }

    #[test]
    fn node_info_splits_host_and_port() {
        let info = node_info("10.1.2.3:6380", RedisConnectionInfo::default()).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("10.1.2.3".to_string(), 6380));

        assert!(matches!(
            node_info("no-port", RedisConnectionInfo::default()),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            node_info("host:99999", RedisConnectionInfo::default()),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn failover_signals_include_readonly() {
        let readonly = RedisError::from((ErrorKind::ReadOnly, "READONLY replica"));
        assert!(signals_failover(&readonly));

        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!signals_failover(&wrong_type));
        assert!(matches!(backend_error(wrong_type), StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let config = ManagerConfig {
            mode: Topology::Sentinel,
            addrs: vec!["127.0.0.1:26379".to_string()],
            ..ManagerConfig::default()
        };
        let err = RedisBackend::connect(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }
}
