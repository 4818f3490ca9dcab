//! Worker configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL` — PostgreSQL connection string (default: unset, in-memory store)
/// - `METRICS_ADDR` — Prometheus scrape listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
/// - `RECOVERY_INTERVAL_SECS` — seconds between recovery scans (default: `30`, `0` disables)
/// - `DEMO_ORDERS` — order fulfillment sagas started at boot (default: `0`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub recovery_interval: Option<Duration>,
    pub demo_orders: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            metrics_addr: std::env::var("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: std::env::var("LOG_FORMAT")
                .ok()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
            recovery_interval: match std::env::var("RECOVERY_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.recovery_interval,
            },
            demo_orders: std::env::var("DEMO_ORDERS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.demo_orders),
        }
    }

    /// Parses the metrics listener address.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.metrics_addr.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            metrics_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            recovery_interval: Some(Duration::from_secs(30)),
            demo_orders: 0,
        }
    }
}
