//! Application configuration loaded from environment variables.

use std::time::Duration;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for structured logs, anything else for text
/// - `DATABASE_URL`: Postgres connection string; unset runs on the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `WEBHOOK_URL`: broker endpoint; unset publishes to the in-memory broker
/// - `WEBHOOK_TIMEOUT_MS`: per-request timeout (default: `5000`)
/// - `OUTBOX_RETENTION_HOURS`: how long published rows are kept (default: `24`)
/// - `OUTBOX_TX_MAX_AGE_SECS`: open transactions older than this are rolled back (default: `300`)
///
/// Relay settings are read separately by `relay::RelayConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub retention: Duration,
    pub transaction_max_age: Duration,
}

fn parse_hours(raw: &str) -> Option<Duration> {
    let hours: u64 = raw.trim().parse().ok()?;
    Some(Duration::from_secs(hours.saturating_mul(3600)))
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: std::env::var("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or_default(),
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            webhook_url: non_empty_var("WEBHOOK_URL"),
            webhook_timeout: std::env::var("WEBHOOK_TIMEOUT_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.webhook_timeout),
            retention: std::env::var("OUTBOX_RETENTION_HOURS")
                .ok()
                .and_then(|h| parse_hours(&h))
                .unwrap_or(defaults.retention),
            transaction_max_age: std::env::var("OUTBOX_TX_MAX_AGE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.transaction_max_age),
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
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            webhook_url: None,
            webhook_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(24 * 3600),
            transaction_max_age: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.retention, Duration::from_secs(86_400));
        assert_eq!(config.transaction_max_age, Duration::from_secs(300));
    }

    #[test]
    fn test_retention_hours_parsing() {
        assert_eq!(parse_hours("2"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_hours("nope"), None);
        assert_eq!(
            parse_hours(&u64::MAX.to_string()),
            Some(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }
}
