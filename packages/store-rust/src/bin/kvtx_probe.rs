//! kvtx-probe - operator check against a live Redis deployment

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvtx_store::{init_tracing, LogConfig, LogFormat, Manager, ManagerConfig, Scored, Topology};

#[derive(Parser)]
#[command(name = "kvtx-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with a full manager config; overrides the connection flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// standalone, sentinel or cluster
    #[arg(long, env = "KVTX_MODE", default_value = "standalone")]
    mode: Topology,

    /// Comma-separated host:port list
    #[arg(long, env = "KVTX_ADDRS", value_delimiter = ',', default_value = "127.0.0.1:6379")]
    addrs: Vec<String>,

    #[arg(long, env = "KVTX_MASTER_NAME")]
    master_name: Option<String>,

    #[arg(long, env = "KVTX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "KVTX_DB", default_value_t = 0)]
    db: i64,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip to the backend
    Ping,

    /// Print a UTF-8 value
    Get { key: String },

    /// Write a UTF-8 value through a transaction
    Set { key: String, value: String },

    /// Print sorted-set members with scores, lowest first
    Zrange {
        key: String,
        #[arg(default_value_t = 0, allow_hyphen_values = true)]
        start: i64,
        #[arg(default_value_t = -1, allow_hyphen_values = true)]
        stop: i64,
    },
}

impl Cli {
    fn manager_config(&self) -> Result<ManagerConfig> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return Ok(ManagerConfig::from_json(&raw)?);
        }
        Ok(ManagerConfig {
            mode: self.mode,
            addrs: self.addrs.clone(),
            master_name: self.master_name.clone(),
            password: self.password.clone(),
            db: self.db,
            ..ManagerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        name: "kvtx-probe".to_string(),
        level: "warn".to_string(),
        format: if cli.json { LogFormat::Json } else { LogFormat::Compact },
    })?;

    let config = cli.manager_config()?;
    let manager = Manager::connect(&config)
        .await
        .with_context(|| format!("connecting to {} {:?}", config.mode, config.addrs))?;

    let outcome = run(&manager, cli.command).await;
    manager.close().await?;
    outcome
}

async fn run(manager: &Manager, command: Command) -> Result<()> {
    match command {
        Command::Ping => {
            manager.ping().await?;
            println!("PONG");
        }
        Command::Get { key } => {
            let kv = manager.register_kv::<String>(&key)?;
            println!("{}", kv.get().await?);
        }
        Command::Set { key, value } => {
            let kv = manager.register_kv::<String>(&key)?;
            let tx = kv.begin_tx().await?;
            tx.set(&value)?;
            tx.commit().await?;
            println!("OK");
        }
        Command::Zrange { key, start, stop } => {
            let zset = manager.register_sorted_set::<Scored<Vec<u8>>>(&key)?;
            for member in zset.range(start, stop).await? {
                println!("{}\t{}", member.score, String::from_utf8_lossy(&member.value));
            }
        }
    }
    Ok(())
}
