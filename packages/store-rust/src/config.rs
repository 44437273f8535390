//! Configuration types for the manager and for logging.
//!
//! Every type derives `serde` so a whole deployment config can be loaded from
//! JSON; missing fields fall back to [`Default`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use kvtx_core::{Result, StoreError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// How the Redis deployment is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Topology {
    /// One node: the first address.
    #[default]
    Standalone,
    /// Addresses are sentinel monitors; the primary is discovered by name.
    Sentinel,
    /// Addresses are cluster seed nodes.
    Cluster,
}

impl FromStr for Topology {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standalone" => Ok(Self::Standalone),
            "sentinel" => Ok(Self::Sentinel),
            "cluster" => Ok(Self::Cluster),
            other => Err(StoreError::InvalidConfig(format!(
                "unsupported redis mode: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Topology {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standalone => "standalone",
            Self::Sentinel => "sentinel",
            Self::Cluster => "cluster",
        })
    }
}

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Connection settings for [`Manager::connect`](crate::Manager::connect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub mode: Topology,
    /// `host:port` entries. Standalone uses the first one; sentinel treats
    /// them as monitors; cluster treats them as seeds.
    pub addrs: Vec<String>,
    /// Primary name monitored by the sentinels. Required for sentinel mode.
    pub master_name: Option<String>,
    #[serde(alias = "redis_pass")]
    pub password: Option<String>,
    /// Logical database. Ignored in cluster mode.
    #[serde(alias = "redis_db")]
    pub db: i64,
    /// Bound on establishing the connection and the initial ping.
    pub connect_timeout_ms: u64,
    /// Per-call deadline on every backend call. 0 disables it.
    pub operation_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mode: Topology::Standalone,
            addrs: Vec::new(),
            master_name: None,
            password: None,
            db: 0,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 0,
        }
    }
}

impl ManagerConfig {
    /// Parses a JSON document. Absent fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if the document does not parse.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    /// Checks that the addresses and names required by `mode` are present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Topology::Standalone if self.addrs.is_empty() => Err(StoreError::InvalidConfig(
                "standalone mode requires one address".to_string(),
            )),
            Topology::Sentinel
                if self.addrs.is_empty()
                    || self.master_name.as_deref().map_or(true, str::is_empty) =>
            {
                Err(StoreError::InvalidConfig(
                    "sentinel mode requires master_name and at least one address".to_string(),
                ))
            }
            Topology::Cluster if self.addrs.is_empty() => Err(StoreError::InvalidConfig(
                "cluster mode requires at least one address".to_string(),
            )),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The per-call deadline, `None` when disabled.
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

/// Settings for [`init_tracing`](crate::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Service name attached to the startup event.
    pub name: String,
    /// Default filter directive, overridden by `RUST_LOG` when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            name: "kvtx".to_string(),
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
