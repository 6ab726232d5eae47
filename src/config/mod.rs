//! Cache settings: loaded once at startup, fatal when absent.
//!
//! Settings live under the `cache_settings` section of a YAML file and can be
//! overridden by `PIPECACHE_`-prefixed environment variables (nested keys are
//! separated with `__`):
//!
//! ```yaml
//! cache_settings:
//!   default_sliding_expiration_seconds: 600
//!   store_timeout_ms: 250
//! ```
//!
//! ```text
//! PIPECACHE_CACHE_SETTINGS__DEFAULT_SLIDING_EXPIRATION_SECONDS=600
//! ```
//!
//! There is no programmatic default for the sliding expiration: a process
//! without it must not serve traffic.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Section of the configuration tree holding [`CacheSettings`].
pub const SECTION: &str = "cache_settings";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PIPECACHE_";

/// Default configuration file, relative to the working directory.
pub const DEFAULT_FILE: &str = "pipecache.yaml";

const DEFAULT_STORE_TIMEOUT_MS: u64 = 1000;

/// Errors produced while loading or validating [`CacheSettings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load cache settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("default_sliding_expiration_seconds must be positive, got {0}")]
    InvalidSlidingExpiration(u64),

    #[error("store_timeout_ms must be positive, got {0}")]
    InvalidStoreTimeout(u64),
}

/// Caching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Sliding TTL applied when a cacheable request does not carry its own.
    pub default_sliding_expiration_seconds: u64,

    /// Upper bound on any single store call.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

impl CacheSettings {
    /// Settings with the given default expiration and the default store timeout.
    pub fn new(default_sliding_expiration_seconds: u64) -> Self {
        Self {
            default_sliding_expiration_seconds,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load from [`DEFAULT_FILE`] merged with the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file(DEFAULT_FILE)
    }

    /// Load from a specific YAML file merged with the environment.
    ///
    /// A missing file is not an error by itself; the environment may still
    /// provide every required value.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(&figment)
    }

    /// Extract and validate the [`SECTION`] of an arbitrary figment.
    pub fn extract(figment: &Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.focus(SECTION).extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_sliding_expiration_seconds == 0 {
            return Err(ConfigError::InvalidSlidingExpiration(
                self.default_sliding_expiration_seconds,
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidStoreTimeout(self.store_timeout_ms));
        }
        Ok(())
    }

    pub fn default_sliding_expiration(&self) -> Duration {
        Duration::from_secs(self.default_sliding_expiration_seconds)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
