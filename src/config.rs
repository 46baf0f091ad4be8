use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::AllocationPolicy;
use crate::model::ActorId;

/// Server settings, read from `COURTSIDE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub owner_self_service: bool,
    pub admins: Vec<ActorId>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "courtside".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(2000),
            owner_self_service: false,
            admins: Vec::new(),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&get, "COURTSIDE_PORT").unwrap_or(defaults.port),
            bind: get("COURTSIDE_BIND").unwrap_or(defaults.bind),
            data_dir: get("COURTSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("COURTSIDE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "COURTSIDE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "COURTSIDE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed(&get, "COURTSIDE_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            owner_self_service: get("COURTSIDE_SELF_SERVICE")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.owner_self_service),
            admins: get("COURTSIDE_ADMINS")
                .map(|v| parse_admins(&v))
                .unwrap_or_default(),
            tls_cert: get("COURTSIDE_TLS_CERT"),
            tls_key: get("COURTSIDE_TLS_KEY"),
            metrics_port: parsed(&get, "COURTSIDE_METRICS_PORT"),
        }
    }

    pub fn policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            lock_timeout: self.lock_timeout,
            owner_self_service: self.owner_self_service,
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_admins(value: &str) -> Vec<ActorId> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ActorId::from)
        .collect()
}
