// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for edgehost-node.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Name of this node; workers whose `node_name` matches run here
    pub node_name: String,
    /// Shared secret node tokens are derived from
    pub cluster_secret: String,
    /// HTTP listen address for the `/agent/*` and `/api/*` surface
    pub http_addr: SocketAddr,
    /// Base URL peers use to reach this node
    pub advertise_endpoint: String,
    /// Master base URL; `None` means this node is the master
    pub master_endpoint: Option<String>,
    /// Root of the on-disk worker layout
    pub worker_dir: PathBuf,
    /// Sandbox runtime binary
    pub runtime_bin: PathBuf,
    /// Extra arguments appended to every runtime invocation
    pub runtime_args: Vec<String>,
    /// Host the worker sockets bind to
    pub worker_host: String,
    /// Ports handed out to workers
    pub port_range: RangeInclusive<u16>,
    /// Local ports that tunnel to managed resources
    pub client_ports: ClientPorts,
    /// Delay before a crashed worker is respawned
    pub restart_delay: Duration,
    /// Period of the agent register/sync loop
    pub sync_interval: Duration,
    /// Whether the agent loop runs pull reconciliation
    pub auto_sync: bool,
}

/// Local ports through which workers reach managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPorts {
    /// PostgreSQL
    pub postgres: u16,
    /// MySQL
    pub mysql: u16,
    /// Key-value store
    pub kv: u16,
}

impl Default for ClientPorts {
    fn default() -> Self {
        Self {
            postgres: 35432,
            mysql: 33306,
            kv: 36379,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("EDGEHOST_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("EDGEHOST_DATABASE_URL"))?;

        let cluster_secret = lookup("EDGEHOST_CLUSTER_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingEnvVar("EDGEHOST_CLUSTER_SECRET"))?;

        let node_name = lookup("EDGEHOST_NODE_NAME").unwrap_or_else(|| "default".to_string());

        let port: u16 = lookup("EDGEHOST_API_PORT")
            .unwrap_or_else(|| "8888".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let advertise_endpoint = lookup("EDGEHOST_ADVERTISE_ENDPOINT")
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let master_endpoint = lookup("EDGEHOST_MASTER_ENDPOINT").filter(|s| !s.is_empty());

        let worker_dir = PathBuf::from(
            lookup("EDGEHOST_WORKER_DIR").unwrap_or_else(|| ".data/workerd".to_string()),
        );

        let runtime_bin =
            PathBuf::from(lookup("EDGEHOST_RUNTIME_BIN").unwrap_or_else(|| "workerd".to_string()));

        let runtime_args = lookup("EDGEHOST_RUNTIME_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let worker_host =
            lookup("EDGEHOST_WORKER_HOST").unwrap_or_else(|| "localhost".to_string());

        let port_range = parse_port_range(
            &lookup("EDGEHOST_PORT_RANGE").unwrap_or_else(|| "20000-30000".to_string()),
        )?;

        let defaults = ClientPorts::default();
        let client_ports = ClientPorts {
            postgres: parse_port(&lookup, "EDGEHOST_CLIENT_POSTGRES_PORT", defaults.postgres)?,
            mysql: parse_port(&lookup, "EDGEHOST_CLIENT_MYSQL_PORT", defaults.mysql)?,
            kv: parse_port(&lookup, "EDGEHOST_CLIENT_KV_PORT", defaults.kv)?,
        };

        let restart_delay_ms: u64 = parse_number(&lookup, "EDGEHOST_RESTART_DELAY_MS", 3000)?;
        let sync_interval_secs: u64 = parse_number(&lookup, "EDGEHOST_SYNC_INTERVAL_SECS", 30)?;

        let auto_sync = lookup("EDGEHOST_AUTO_SYNC")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            node_name,
            cluster_secret,
            http_addr,
            advertise_endpoint,
            master_endpoint,
            worker_dir,
            runtime_bin,
            runtime_args,
            worker_host,
            port_range,
            client_ports,
            restart_delay: Duration::from_millis(restart_delay_ms),
            sync_interval: Duration::from_secs(sync_interval_secs),
            auto_sync,
        })
    }

    /// Whether this node holds the authoritative worker set.
    pub fn is_master(&self) -> bool {
        self.master_endpoint.is_none()
    }
}

fn parse_port<F>(lookup: &F, key: &'static str, default: u16) -> Result<u16, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidPort),
        None => Ok(default),
    }
}

fn parse_number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue(key)),
        None => Ok(default),
    }
}

fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let (start, end) = value
        .split_once('-')
        .ok_or(ConfigError::InvalidValue("EDGEHOST_PORT_RANGE"))?;
    let start: u16 = start.trim().parse().map_err(|_| ConfigError::InvalidPort)?;
    let end: u16 = end.trim().parse().map_err(|_| ConfigError::InvalidPort)?;
    if start == 0 || start > end {
        return Err(ConfigError::InvalidValue("EDGEHOST_PORT_RANGE"));
    }
    Ok(start..=end)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}
