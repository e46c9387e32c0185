use crate::dispatch::QueueConfig;
use crate::lock::LockConfig;
use crate::semaphore::SemaphoreConfig;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage_type: StorageType,
    pub redis_url: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub server_host: String,
    pub server_port: u16,
    pub lock_retry_interval_ms: u64,
    pub optimistic_max_wait_ms: u64,
    pub semaphore_lock_timeout_ms: u64,
    pub semaphore_lock_hold_ms: u64,
    pub dispatcher_count: usize,
    pub dispatch_poll_interval_ms: u64,
    pub dispatch_claim_timeout_ms: u64,
    pub dispatch_claim_hold_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Redis,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意 key/value 来源读取配置，缺失或无法解析的项使用默认值
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage_type = lookup("STORAGE_TYPE")
            .unwrap_or_else(|| "memory".to_string())
            .to_lowercase();

        let storage_type = match storage_type.as_str() {
            "redis" => StorageType::Redis,
            _ => StorageType::Memory,
        };

        let redis_url = if storage_type == StorageType::Redis {
            Some(lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()))
        } else {
            None
        };

        Self {
            storage_type,
            redis_url,
            redis_username: lookup("REDIS_USERNAME"),
            redis_password: lookup("REDIS_PASSWORD"),
            redis_db: lookup("REDIS_DB").and_then(|s| s.parse::<i64>().ok()),
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            server_port: parse_or(lookup("SERVER_PORT"), 8080),
            lock_retry_interval_ms: parse_or(lookup("LOCK_RETRY_INTERVAL_MS"), 10),
            optimistic_max_wait_ms: parse_or(lookup("OPTIMISTIC_MAX_WAIT_MS"), 5000),
            semaphore_lock_timeout_ms: parse_or(lookup("SEMAPHORE_LOCK_TIMEOUT_MS"), 1000),
            semaphore_lock_hold_ms: parse_or(lookup("SEMAPHORE_LOCK_HOLD_MS"), 10_000),
            dispatcher_count: parse_or(lookup("DISPATCHER_COUNT"), 1),
            dispatch_poll_interval_ms: parse_or(lookup("DISPATCH_POLL_INTERVAL_MS"), 100),
            dispatch_claim_timeout_ms: parse_or(lookup("DISPATCH_CLAIM_TIMEOUT_MS"), 10),
            dispatch_claim_hold_ms: parse_or(lookup("DISPATCH_CLAIM_HOLD_MS"), 10_000),
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
            max_wait: Duration::from_millis(self.optimistic_max_wait_ms),
            ..LockConfig::default()
        }
    }

    pub fn semaphore_config(&self) -> SemaphoreConfig {
        SemaphoreConfig {
            lock_acquire_timeout: Duration::from_millis(self.semaphore_lock_timeout_ms),
            lock_hold: Duration::from_millis(self.semaphore_lock_hold_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(self.dispatch_poll_interval_ms),
            claim_timeout: Duration::from_millis(self.dispatch_claim_timeout_ms),
            claim_hold: Duration::from_millis(self.dispatch_claim_hold_ms),
            max_wait: Duration::from_millis(self.optimistic_max_wait_ms),
            ..QueueConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.storage_type, StorageType::Memory);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.dispatcher_count, 1);
        assert_eq!(config.queue_config().poll_interval, Duration::from_millis(100));
        assert_eq!(config.lock_config().key_prefix, "lock:");
    }

    #[test]
    fn test_redis_settings() {
        let config = config_from(&[
            ("STORAGE_TYPE", "Redis"),
            ("REDIS_DB", "3"),
            ("LOCK_RETRY_INTERVAL_MS", "25"),
            ("SERVER_PORT", "not-a-port"),
        ]);

        assert_eq!(config.storage_type, StorageType::Redis);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.redis_db, Some(3));
        assert_eq!(config.lock_config().retry_interval, Duration::from_millis(25));
        assert_eq!(config.server_port, 8080);
    }
}
