//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

/// Orchestrator tuning with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_STEP_TIMEOUT_MS` — default per-attempt step timeout (default: `30000`, `0` disables)
/// - `SAGA_TIMEOUT_MS` — default saga timeout (default: none)
/// - `SAGA_COMPENSATION_TIMEOUT_MS` — default compensation attempt timeout (default: `30000`)
/// - `SAGA_SNAPSHOT_INTERVAL` — records between snapshots (default: `10`, `0` disables)
/// - `SAGA_MAX_CONFLICT_RETRIES` — reloads after a version conflict (default: `3`)
/// - `SAGA_CANCEL_GRACE_MS` — how long a cancelled step may take to stop (default: `1000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Used when a step has no timeout of its own.
    pub step_timeout: Option<Duration>,
    /// Used when a definition has no saga timeout.
    pub saga_timeout: Option<Duration>,
    /// Used for compensation attempts of steps without a timeout.
    pub compensation_timeout: Duration,
    pub snapshot_interval: u64,
    pub max_conflict_retries: u32,
    pub cancellation_grace: Duration,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            step_timeout: match env_u64("SAGA_STEP_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.step_timeout,
            },
            saga_timeout: env_u64("SAGA_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            compensation_timeout: env_u64("SAGA_COMPENSATION_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map_or(defaults.compensation_timeout, Duration::from_millis),
            snapshot_interval: env_u64("SAGA_SNAPSHOT_INTERVAL")
                .unwrap_or(defaults.snapshot_interval),
            max_conflict_retries: std::env::var("SAGA_MAX_CONFLICT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_conflict_retries),
            cancellation_grace: env_u64("SAGA_CANCEL_GRACE_MS")
                .map_or(defaults.cancellation_grace, Duration::from_millis),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_saga_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.saga_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_cancellation_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace = grace;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(30)),
            saga_timeout: None,
            compensation_timeout: Duration::from_secs(30),
            snapshot_interval: 10,
            max_conflict_retries: 3,
            cancellation_grace: Duration::from_secs(1),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.step_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.saga_timeout, None);
        assert_eq!(config.compensation_timeout, Duration::from_secs(30));
        assert_eq!(config.snapshot_interval, 10);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.cancellation_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_overrides() {
        let config = OrchestratorConfig::default()
            .with_step_timeout(None)
            .with_saga_timeout(Some(Duration::from_secs(5)))
            .with_snapshot_interval(0)
            .with_cancellation_grace(Duration::ZERO);
        assert_eq!(config.step_timeout, None);
        assert_eq!(config.saga_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.snapshot_interval, 0);
        assert_eq!(config.cancellation_grace, Duration::ZERO);
    }

    #[test]
    fn test_from_env_without_overrides_uses_defaults() {
        // None of the SAGA_* variables are set in the test environment
        if std::env::vars().any(|(k, _)| k.starts_with("SAGA_")) {
            return;
        }
        assert_eq!(OrchestratorConfig::from_env(), OrchestratorConfig::default());
    }
}
