//! Driver configuration: the one value supplied at construction time.

use std::time::Duration;

/// Storage backend selected by [`DriverConfig`]. Only `Worker` has a full
/// implementation; the others are named so callers see a clear error rather
/// than a missing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    LocalStorage,
    SessionStorage,
    Worker,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::LocalStorage => "localStorage",
            Backend::SessionStorage => "sessionStorage",
            Backend::Worker => "worker",
        }
    }
}

/// Configuration supplied once at construction and immutable thereafter.
///
/// `database_path` empty means an ephemeral database (a fresh, unnamed
/// on-disk file is still opened for `Backend::Worker`, since there is no
/// in-process OPFS equivalent of "no file at all" once WAL is in play).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub database_path: String,
    pub backend: Backend,
    pub verbose: bool,
    pub retry: RetryConfig,
}

/// Tuning knobs for the dual-engine sync queue's retry/backoff, overridable
/// via environment variables the way the teacher's pool tuning constants are
/// meant to be adjusted per-deployment.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryConfig {
    /// Reads `SQLWORKER_MAX_RETRIES`, `SQLWORKER_BASE_DELAY_MS`,
    /// `SQLWORKER_MAX_DELAY_MS`, falling back to the documented defaults for
    /// any variable that is unset or fails to parse.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_retries: env_value("SQLWORKER_MAX_RETRIES", default.max_retries),
            base_delay: Duration::from_millis(env_value(
                "SQLWORKER_BASE_DELAY_MS",
                default.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_value(
                "SQLWORKER_MAX_DELAY_MS",
                default.max_delay.as_millis() as u64,
            )),
        }
    }

    /// `min(base * 2^retry_count, max)`, the documented backoff formula.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let scaled = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << retry_count.min(32));
        Duration::from_millis(scaled.min(self.max_delay.as_millis()) as u64)
    }
}

fn env_value<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl DriverConfig {
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }
}

/// Builder for [`DriverConfig`].
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    database_path: Option<String>,
    backend: Option<Backend>,
    verbose: bool,
    retry: Option<RetryConfig>,
}

impl DriverConfigBuilder {
    pub fn database_path(mut self, path: impl Into<String>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> DriverConfig {
        DriverConfig {
            database_path: self.database_path.unwrap_or_default(),
            backend: self.backend.unwrap_or(Backend::Worker),
            verbose: self.verbose,
            retry: self.retry.unwrap_or_else(RetryConfig::from_env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_follows_exponential_backoff_capped_at_max() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(10), Duration::from_millis(5_000));
    }

    #[test]
    fn builder_defaults_to_worker_backend() {
        let cfg = DriverConfig::builder().database_path("t.db").build();
        assert_eq!(cfg.backend, Backend::Worker);
        assert_eq!(cfg.database_path, "t.db");
    }
}
