//! Configuration handling for db-transactor.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;

// Pool configuration defaults
pub const CONNS_PER_CPU: u32 = 10;
pub const DEFAULT_CONN_MAX_IDLE_TIME_SECS: u64 = 60;
pub const DEFAULT_CONN_MAX_LIFE_TIME_SECS: u64 = 5 * 60;

/// Connection pool configuration. Zero or missing values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle connections to keep (default: 10 per CPU)
    pub max_idle_conns: Option<u32>,
    /// Open connections allowed (default: 10 per CPU)
    pub max_open_conns: Option<u32>,
    /// Seconds a connection may sit idle before it is closed (default: 60)
    pub conn_max_idle_time_secs: Option<u64>,
    /// Seconds a connection may live before it is recycled (default: 300)
    pub conn_max_life_time_secs: Option<u64>,
}

/// Pool limits after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
    pub conn_max_idle_time: Duration,
    pub conn_max_life_time: Duration,
}

impl PoolConfig {
    /// Apply defaults using the machine's available parallelism.
    pub fn resolve(&self) -> PoolSettings {
        self.resolve_with_parallelism(available_parallelism())
    }

    pub fn resolve_with_parallelism(&self, parallelism: u32) -> PoolSettings {
        let default_conns = CONNS_PER_CPU.saturating_mul(parallelism.max(1));
        PoolSettings {
            max_idle_conns: non_zero(self.max_idle_conns).unwrap_or(default_conns),
            max_open_conns: non_zero(self.max_open_conns).unwrap_or(default_conns),
            conn_max_idle_time: Duration::from_secs(
                non_zero(self.conn_max_idle_time_secs).unwrap_or(DEFAULT_CONN_MAX_IDLE_TIME_SECS),
            ),
            conn_max_life_time: Duration::from_secs(
                non_zero(self.conn_max_life_time_secs).unwrap_or(DEFAULT_CONN_MAX_LIFE_TIME_SECS),
            ),
        }
    }
}

fn non_zero<T: Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

fn available_parallelism() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX)
}

/// Transaction isolation level applied to every transaction the transactor opens.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Whatever the server is configured with
    Default,
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, or `None` to leave the server default in place.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::ReadUncommitted => write!(f, "read-uncommitted"),
            Self::ReadCommitted => write!(f, "read-committed"),
            Self::RepeatableRead => write!(f, "repeatable-read"),
            Self::Serializable => write!(f, "serializable"),
        }
    }
}

/// Options applied to every transaction a transactor begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactorConfig {
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[serde(default)]
    pub read_only: bool,
}

/// Configuration for db-transactor.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-transactor",
    about = "Transactional data access over PostgreSQL or SQLite, served over HTTP",
    version,
    author
)]
pub struct Config {
    /// Primary database URL (postgres://..., postgresql://... or sqlite:...)
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub database_url: String,

    /// Replica database URL. Defaults to the primary.
    #[arg(long, value_name = "URL", env = "DATABASE_REPLICA_URL")]
    pub replica_url: Option<String>,

    /// Maximum idle connections per pool (default: 10 per CPU)
    #[arg(long, env = "MAX_IDLE_CONNS")]
    pub max_idle_conns: Option<u32>,

    /// Maximum open connections per pool (default: 10 per CPU)
    #[arg(long, env = "MAX_OPEN_CONNS")]
    pub max_open_conns: Option<u32>,

    /// Idle connection lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_CONN_MAX_IDLE_TIME_SECS, env = "CONN_MAX_IDLE_TIME")]
    pub conn_max_idle_time: u64,

    /// Maximum connection lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_CONN_MAX_LIFE_TIME_SECS, env = "CONN_MAX_LIFE_TIME")]
    pub conn_max_life_time: u64,

    /// Transaction isolation level
    #[arg(
        long,
        value_enum,
        default_value = "repeatable-read",
        env = "TX_ISOLATION_LEVEL"
    )]
    pub isolation_level: IsolationLevel,

    /// Open every transaction read-only
    #[arg(long, env = "TX_READ_ONLY")]
    pub read_only: bool,

    /// HTTP host to bind to
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "HTTP_PORT")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a configuration for `database_url` with every other option at
    /// its default (useful for testing).
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            replica_url: None,
            max_idle_conns: None,
            max_open_conns: None,
            conn_max_idle_time: DEFAULT_CONN_MAX_IDLE_TIME_SECS,
            conn_max_life_time: DEFAULT_CONN_MAX_LIFE_TIME_SECS,
            isolation_level: IsolationLevel::default(),
            read_only: false,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            conn_max_idle_time_secs: Some(self.conn_max_idle_time),
            conn_max_life_time_secs: Some(self.conn_max_life_time),
        }
    }

    pub fn transactor_config(&self) -> TransactorConfig {
        TransactorConfig {
            isolation: self.isolation_level,
            read_only: self.read_only,
        }
    }
}

/// Mask the password of a connection URL for logging.
///
/// URLs that do not parse (e.g. `sqlite::memory:`) carry no credentials and
/// are returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            // set_password only fails for cannot-be-a-base URLs, which have no password
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}
