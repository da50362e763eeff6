//! Daemon configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use relay::WorkerConfig;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Relay daemon configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (default: unset, in-memory backend)
/// - `RELAY_POLL_INTERVAL_MS`: poll interval (default: `1000`)
/// - `RELAY_BATCH_SIZE`: records per cycle (default: `100`)
/// - `RELAY_MAX_RETRIES`: failed publishes before a record is abandoned (default: `5`)
/// - `RELAY_STALE_AFTER_SECS`: age at which a claim is reclaimed (default: `300`,
///   never less than twice the publish timeout)
/// - `RELAY_PUBLISH_TIMEOUT_SECS`: upper bound for one publish call (default: `30`)
/// - `METRICS_ADDR`: Prometheus listener address (default: `"0.0.0.0:9000"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_retries: i32,
    pub stale_after: Duration,
    pub publish_timeout: Duration,
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let publish_timeout = parsed("RELAY_PUBLISH_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.publish_timeout);

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            poll_interval: parsed("RELAY_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: parsed("RELAY_BATCH_SIZE")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            max_retries: parsed("RELAY_MAX_RETRIES")
                .and_then(|n| i32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_retries),
            stale_after: parsed("RELAY_STALE_AFTER_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after)
                .max(WorkerConfig::min_stale_after(publish_timeout)),
            publish_timeout,
            metrics_addr: lookup("METRICS_ADDR")
                .and_then(|addr| addr.trim().parse().ok())
                .unwrap_or(defaults.metrics_addr),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
        }
    }

    /// Returns the worker settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            stale_after: self.stale_after,
            publish_timeout: self.publish_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            max_retries: 5,
            stale_after: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(30),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.publish_timeout, Duration::from_secs(30));
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = from_pairs(&[]);
        assert!(config.database_url.is_none());
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://relay@localhost/outbox"),
            ("RELAY_POLL_INTERVAL_MS", "250"),
            ("RELAY_BATCH_SIZE", "20"),
            ("RELAY_MAX_RETRIES", "8"),
            ("RELAY_STALE_AFTER_SECS", "60"),
            ("RELAY_PUBLISH_TIMEOUT_SECS", "10"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
            ("LOG_FORMAT", "JSON"),
        ]);

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://relay@localhost/outbox")
        );
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert_eq!(config.metrics_addr.to_string(), "127.0.0.1:9100");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("DATABASE_URL", "  "),
            ("RELAY_POLL_INTERVAL_MS", "0"),
            ("RELAY_BATCH_SIZE", "many"),
            ("RELAY_MAX_RETRIES", "-1"),
            ("METRICS_ADDR", "not an address"),
            ("LOG_FORMAT", "xml"),
        ]);

        assert!(config.database_url.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_worker_config() {
        let config = from_pairs(&[("RELAY_BATCH_SIZE", "7"), ("RELAY_MAX_RETRIES", "2")]);
        let worker = config.worker_config();
        assert_eq!(worker.batch_size, 7);
        assert_eq!(worker.max_retries, 2);
        assert_eq!(worker.publish_timeout, WorkerConfig::default().publish_timeout);
    }

    #[test]
    fn test_stale_after_never_undercuts_publish_timeout() {
        let config = from_pairs(&[("RELAY_STALE_AFTER_SECS", "10")]);
        assert_eq!(config.stale_after, Duration::from_secs(60));

        let config = from_pairs(&[("RELAY_STALE_AFTER_SECS", "0")]);
        assert_eq!(config.stale_after, Duration::from_secs(300));

        let config = from_pairs(&[
            ("RELAY_STALE_AFTER_SECS", "300"),
            ("RELAY_PUBLISH_TIMEOUT_SECS", "600"),
        ]);
        assert_eq!(config.stale_after, Duration::from_secs(1200));
        assert!(config.worker_config().stale_after > config.publish_timeout);
    }
}
