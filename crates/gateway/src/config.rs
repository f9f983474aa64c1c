//! Environment-driven gateway configuration.

use crate::error::{GatewayError, Result};
use game_manager::{GameManagerConfig, DEFAULT_GRACE_PERIOD};
use persistence_worker::WorkerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where games, moves and the move queue live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Redis store and queue, NATS fan-out.
    Redis,
    /// Everything in process. Single instance only.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(GatewayError::Config(format!(
                "unknown STORAGE_BACKEND: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub nats_url: String,
    pub redis_url: String,
    pub storage: StorageBackend,
    /// Run the persistence worker inside the gateway process.
    pub embedded_worker: bool,
    pub grace_period: Duration,
    pub ping_interval: Duration,
    pub worker: WorkerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            metrics_port: 9090,
            nats_url: "nats://localhost:4222".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            storage: StorageBackend::Redis,
            embedded_worker: true,
            grace_period: DEFAULT_GRACE_PERIOD,
            ping_interval: Duration::from_secs(30),
            worker: WorkerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse(&lookup, "HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(port) = parse(&lookup, "METRICS_PORT")? {
            config.metrics_port = port;
        }
        if let Some(url) = lookup("NATS_URL") {
            config.nats_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(raw) = lookup("STORAGE_BACKEND") {
            config.storage = raw.parse()?;
        }
        if let Some(enabled) = parse(&lookup, "EMBEDDED_WORKER")? {
            config.embedded_worker = enabled;
        }
        if let Some(secs) = parse(&lookup, "DISCONNECT_GRACE_SECS")? {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "PING_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(GatewayError::Config(
                    "PING_INTERVAL_SECS must be positive".into(),
                ));
            }
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "WORKER_RETRY_DELAY_MS")? {
            config.worker.retry_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse(&lookup, "WORKER_MAX_INSERT_ATTEMPTS")? {
            config.worker.max_insert_attempts = attempts;
        }

        Ok(config)
    }

    pub fn manager_config(&self) -> GameManagerConfig {
        GameManagerConfig {
            grace_period: self.grace_period,
            ..GameManagerConfig::default()
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GatewayError::Config(format!("invalid {}: {}", key, raw))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.storage, StorageBackend::Redis);
        assert!(config.embedded_worker);
        assert_eq!(config.grace_period, Duration::from_secs(15));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("HTTP_PORT", "9000"),
            ("STORAGE_BACKEND", "Memory"),
            ("EMBEDDED_WORKER", "false"),
            ("DISCONNECT_GRACE_SECS", "5"),
            ("WORKER_MAX_INSERT_ATTEMPTS", "7"),
        ]))
        .unwrap();

        assert_eq!(config.http_port, 9000);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(!config.embedded_worker);
        assert_eq!(config.manager_config().grace_period, Duration::from_secs(5));
        assert_eq!(config.worker.max_insert_attempts, 7);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(GatewayConfig::from_lookup(lookup(&[("HTTP_PORT", "eighty")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "postgres")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("PING_INTERVAL_SECS", "0")])).is_err());
    }
}
