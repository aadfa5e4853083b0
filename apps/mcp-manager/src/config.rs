use std::net::SocketAddr;
use std::time::Duration;

use manager_sdk::protocol::WorkerType;
use serde::Deserialize;

use crate::registry::RegistryTiming;
use crate::session::SessionTiming;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid bind address `{value}`: {source}")]
    BindAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("invalid standalone worker entry `{0}`, expected `type=url`")]
    StandaloneWorker(String),
}

/// Raw settings as read from the environment (`MCP_MANAGER_*`).
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default)]
    manager_id: Option<String>,
    #[serde(default)]
    manager_address: Option<String>,
    #[serde(default)]
    worker_broker_address: Option<String>,
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default = "default_log_filter")]
    log_filter: String,
    #[serde(default)]
    standalone_workers: Option<String>,
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    ping_interval_ms: u64,
    #[serde(default = "default_manager_dead_after_ms")]
    manager_dead_after_ms: u64,
    #[serde(default = "default_session_dead_after_ms")]
    session_dead_after_ms: u64,
    #[serde(default = "default_monitor_tick_ms")]
    monitor_tick_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    response_timeout_ms: u64,
    #[serde(default = "default_local_discard_after_ms")]
    local_discard_after_ms: u64,
    #[serde(default = "default_remote_discard_after_ms")]
    remote_discard_after_ms: u64,
    #[serde(default = "default_connection_inactivity_ms")]
    connection_inactivity_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:7070".into()
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mcp_manager=debug".into())
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_manager_dead_after_ms() -> u64 {
    15_000
}

fn default_session_dead_after_ms() -> u64 {
    60_000
}

fn default_monitor_tick_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    60_000
}

fn default_local_discard_after_ms() -> u64 {
    5 * 60_000
}

fn default_remote_discard_after_ms() -> u64 {
    60_000
}

fn default_connection_inactivity_ms() -> u64 {
    5 * 60_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneWorker {
    pub worker_type: WorkerType,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub manager_id: String,
    pub manager_address: String,
    pub worker_broker_address: String,
    pub redis_url: Option<String>,
    pub log_filter: String,
    pub standalone_workers: Vec<StandaloneWorker>,
    pub lock_timeout: Duration,
    pub connection_inactivity: Duration,
    pub registry: RegistryTiming,
    pub session: SessionTiming,
}

impl AppConfig {
    /// Loads `.env` if present, then reads `MCP_MANAGER_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let raw: RawConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("MCP_MANAGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let bind_addr: SocketAddr =
            raw.bind_addr
                .parse()
                .map_err(|source| ConfigError::BindAddr {
                    value: raw.bind_addr.clone(),
                    source,
                })?;
        let manager_id = normalize(raw.manager_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let manager_address = normalize(raw.manager_address)
            .unwrap_or_else(|| format!("http://{}", advertised(bind_addr)));
        let worker_broker_address =
            normalize(raw.worker_broker_address).unwrap_or_else(|| manager_address.clone());
        let standalone_workers = match normalize(raw.standalone_workers) {
            Some(list) => parse_standalone_workers(&list)?,
            None => Vec::new(),
        };

        let ms = Duration::from_millis;
        Ok(Self {
            bind_addr,
            manager_id,
            manager_address,
            worker_broker_address,
            redis_url: normalize(raw.redis_url),
            log_filter: raw.log_filter,
            standalone_workers,
            lock_timeout: ms(raw.lock_timeout_ms),
            connection_inactivity: ms(raw.connection_inactivity_ms),
            registry: RegistryTiming {
                ping_interval: ms(raw.ping_interval_ms),
                cleanup_interval: ms(raw.ping_interval_ms),
                manager_dead_after: ms(raw.manager_dead_after_ms),
                session_dead_after: ms(raw.session_dead_after_ms),
            },
            session: SessionTiming {
                monitor_tick: ms(raw.monitor_tick_ms),
                response_timeout: ms(raw.response_timeout_ms),
                local_discard_after: ms(raw.local_discard_after_ms),
                remote_discard_after: ms(raw.remote_discard_after_ms),
                ..SessionTiming::default()
            },
        })
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn advertised(bind_addr: SocketAddr) -> SocketAddr {
    if bind_addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], bind_addr.port()))
    } else {
        bind_addr
    }
}

/// Parses `container=http://host:port,remote=http://other` into workers.
pub fn parse_standalone_workers(list: &str) -> Result<Vec<StandaloneWorker>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (kind, address) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::StandaloneWorker(entry.to_string()))?;
            let worker_type = kind
                .trim()
                .parse::<WorkerType>()
                .map_err(|_| ConfigError::StandaloneWorker(entry.to_string()))?;
            let address = address.trim();
            if address.is_empty() {
                return Err(ConfigError::StandaloneWorker(entry.to_string()));
            }
            Ok(StandaloneWorker {
                worker_type,
                address: address.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawConfig {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn defaults_match_documented_timings() {
        let cfg = AppConfig::from_raw(raw()).unwrap();
        assert_eq!(cfg.bind_addr.port(), 7070);
        assert_eq!(cfg.manager_address, "http://127.0.0.1:7070");
        assert_eq!(cfg.registry.ping_interval, Duration::from_secs(10));
        assert_eq!(cfg.registry.manager_dead_after, Duration::from_secs(15));
        assert_eq!(cfg.registry.session_dead_after, Duration::from_secs(60));
        assert_eq!(cfg.session.monitor_tick, Duration::from_secs(5));
        assert_eq!(cfg.session.local_discard_after, Duration::from_secs(300));
        assert!(cfg.standalone_workers.is_empty());
        assert!(!cfg.manager_id.is_empty());
    }

    #[test]
    fn rejects_bad_bind_addr() {
        let mut raw = raw();
        raw.bind_addr = "not-an-addr".into();
        assert!(matches!(
            AppConfig::from_raw(raw),
            Err(ConfigError::BindAddr { .. })
        ));
    }

    #[test]
    fn parses_standalone_workers() {
        let workers =
            parse_standalone_workers("container=http://10.0.0.1:9000, remote=http://10.0.0.2:9000")
                .unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].worker_type, WorkerType::Container);
        assert_eq!(workers[1].address, "http://10.0.0.2:9000");
        assert!(parse_standalone_workers("gpu=http://x").is_err());
        assert!(parse_standalone_workers("container").is_err());
    }
}
