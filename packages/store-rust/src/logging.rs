//! Tracing subscriber setup.

use kvtx_core::{Result, StoreError};
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| StoreError::InvalidConfig(format!("log filter `{directives}`: {e}")))
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// `RUST_LOG`, when set and non-empty, replaces `config.level`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidConfig`] if the filter does not parse or a
/// global subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(parse_filter(&directives)?);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| StoreError::InvalidConfig(format!("tracing subscriber: {e}")))?;

    tracing::info!(service = %config.name, format = ?config.format, "tracing initialised");
    Ok(())
}
