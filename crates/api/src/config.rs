//! Application configuration loaded from environment variables.

use std::time::Duration;

/// Server and saga configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `POLL_INTERVAL_SECS` — recovery poller tick interval (default: `5`)
/// - `PUBLISH_MAX_ATTEMPTS` — dispatcher retry budget (default: `3`)
/// - `PUBLISH_RETRY_DELAY_MS` — delay between publish attempts (default: `1000`)
/// - `DELIVERY_LOCK_TTL_SECS` — consumer delivery-lock TTL (default: `4`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub poll_interval: Duration,
    pub publish_max_attempts: u32,
    pub publish_retry_delay: Duration,
    pub delivery_lock_ttl: Duration,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parsed("PORT", 3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            poll_interval: Duration::from_secs(env_parsed("POLL_INTERVAL_SECS", 5)),
            publish_max_attempts: env_parsed("PUBLISH_MAX_ATTEMPTS", 3),
            publish_retry_delay: Duration::from_millis(env_parsed("PUBLISH_RETRY_DELAY_MS", 1000)),
            delivery_lock_ttl: Duration::from_secs(env_parsed("DELIVERY_LOCK_TTL_SECS", 4)),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(5),
            publish_max_attempts: 3,
            publish_retry_delay: Duration::from_millis(1000),
            delivery_lock_ttl: Duration::from_secs(4),
        }
    }
}
