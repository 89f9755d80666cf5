//! Sync configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::retry::RetryPolicy;

const DEFAULT_API_URL: &str = "http://localhost:54321";

/// Settings for the offline layer: backend location, cache database, timings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    /// SQLite URL of the local cache; `None` resolves to the OS data directory.
    pub cache_db_url: Option<String>,
    /// Background drain/refresh interval while online.
    pub sync_interval: Duration,
    /// Upper bound for every remote call.
    pub remote_timeout: Duration,
    /// Failed attempts after which a transient failure needs attention.
    pub max_retries: u32,
    /// A collection older than this is refreshed on the next interval tick.
    pub refresh_max_age: Duration,
    /// How many days of temperature readings a refresh pulls.
    pub reading_window_days: u32,
    /// Delay between drains after failures.
    pub retry_backoff: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            cache_db_url: None,
            sync_interval: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(20),
            max_retries: 5,
            refresh_max_age: Duration::from_secs(300),
            reading_window_days: 7,
            retry_backoff: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Read `STOCKPRO_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("STOCKPRO_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("STOCKPRO_API_KEY").ok().filter(|k| !k.is_empty()),
            cache_db_url: std::env::var("STOCKPRO_CACHE_DB").ok().filter(|u| !u.is_empty()),
            sync_interval: env_secs("STOCKPRO_SYNC_INTERVAL_SECS", defaults.sync_interval),
            remote_timeout: env_secs("STOCKPRO_REMOTE_TIMEOUT_SECS", defaults.remote_timeout),
            max_retries: env_parse("STOCKPRO_MAX_RETRIES", defaults.max_retries),
            refresh_max_age: env_secs("STOCKPRO_REFRESH_MAX_AGE_SECS", defaults.refresh_max_age),
            reading_window_days: env_parse(
                "STOCKPRO_READING_WINDOW_DAYS",
                defaults.reading_window_days,
            ),
            retry_backoff: defaults.retry_backoff,
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_cache_db_url(mut self, url: impl Into<String>) -> Self {
        self.cache_db_url = Some(url.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_refresh_max_age(mut self, max_age: Duration) -> Self {
        self.refresh_max_age = max_age;
        self
    }

    pub fn with_retry_backoff(mut self, policy: RetryPolicy) -> Self {
        self.retry_backoff = policy;
        self
    }

    /// Cache database URL, resolving the default location when unset.
    pub fn resolved_cache_db_url(&self) -> anyhow::Result<String> {
        match &self.cache_db_url {
            Some(url) => Ok(url.clone()),
            None => {
                let path = cache_db_path()?;
                Ok(format!("sqlite://{}", path.to_string_lossy()))
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("ignoring invalid {name}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

/// Resolve the path to the cache database: `{app_data_dir}/stockpro/cache.db`.
pub fn cache_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut dir = base;
    dir.push("stockpro");

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create cache directory at {:?}", dir))?;

    dir.push("cache.db");

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.remote_timeout, Duration::from_secs(20));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.refresh_max_age, Duration::from_secs(300));
        assert_eq!(config.reading_window_days, 7);
    }

    #[test]
    fn builders_override_fields() {
        let config = SyncConfig::default()
            .with_api_url("https://kitchen.example.com")
            .with_api_key("anon")
            .with_cache_db_url("sqlite::memory:")
            .with_max_retries(2);
        assert_eq!(config.api_url, "https://kitchen.example.com");
        assert_eq!(config.api_key.as_deref(), Some("anon"));
        assert_eq!(config.resolved_cache_db_url().unwrap(), "sqlite::memory:");
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn invalid_env_value_falls_back() {
        // Unique name so parallel tests do not race on the environment.
        let name = "STOCKPRO_TEST_INVALID_SECS";
        unsafe { std::env::set_var(name, "soon") };
        assert_eq!(env_secs(name, Duration::from_secs(9)), Duration::from_secs(9));
        unsafe { std::env::remove_var(name) };
    }
}
