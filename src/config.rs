//! Coordinator configuration loaded from `turnstile.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `TURNSTILE_LOCK_TTL_MS` and `TURNSTILE_LOCK_TIMEOUT_MS` take precedence
//! over the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::state_machine::TransitionOptions;

pub const DEFAULT_CONFIG_FILE: &str = "turnstile.toml";

const ENV_LOCK_TTL_MS: &str = "TURNSTILE_LOCK_TTL_MS";
const ENV_LOCK_TIMEOUT_MS: &str = "TURNSTILE_LOCK_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinatorConfig {
    /// Lifetime of an entity lock. Must outlast the slowest critical section.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long a transition waits for a busy lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_retry_base_ms")]
    pub lock_retry_base_ms: u64,

    #[serde(default = "default_lock_retry_max_ms")]
    pub lock_retry_max_ms: u64,

    /// Re-validations inside the lock when a bypassing writer moved the version.
    #[serde(default = "default_transition_max_retries")]
    pub transition_max_retries: u32,

    #[serde(default = "default_merge_max_retries")]
    pub merge_max_retries: u32,

    #[serde(default = "default_merge_retry_base_ms")]
    pub merge_retry_base_ms: u64,

    #[serde(default = "default_merge_retry_max_ms")]
    pub merge_retry_max_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    5000
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_lock_retry_base_ms() -> u64 {
    5
}

fn default_lock_retry_max_ms() -> u64 {
    50
}

fn default_transition_max_retries() -> u32 {
    3
}

fn default_merge_max_retries() -> u32 {
    32
}

fn default_merge_retry_base_ms() -> u64 {
    1
}

fn default_merge_retry_max_ms() -> u64 {
    25
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_base_ms: default_lock_retry_base_ms(),
            lock_retry_max_ms: default_lock_retry_max_ms(),
            transition_max_retries: default_transition_max_retries(),
            merge_max_retries: default_merge_max_retries(),
            merge_retry_base_ms: default_merge_retry_base_ms(),
            merge_retry_max_ms: default_merge_retry_max_ms(),
        }
    }
}

impl CoordinatorConfig {
    /// Load `turnstile.toml` from the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path`, falling back to defaults when it does not exist,
    /// then apply environment overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<CoordinatorConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_LOCK_TTL_MS)
            && !value.is_empty()
        {
            self.lock_ttl_ms = parse_ms(ENV_LOCK_TTL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_TIMEOUT_MS)
            && !value.is_empty()
        {
            self.lock_timeout_ms = parse_ms(ENV_LOCK_TIMEOUT_MS, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lock_ttl_ms must be positive".into()));
        }
        if self.lock_ttl_ms < self.lock_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "lock_ttl_ms ({}) must not be shorter than lock_timeout_ms ({})",
                self.lock_ttl_ms, self.lock_timeout_ms
            )));
        }
        if self.lock_retry_base_ms > self.lock_retry_max_ms || self.merge_retry_base_ms > self.merge_retry_max_ms {
            return Err(ConfigError::Invalid("retry base delay exceeds its max delay".into()));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Default options for every transition.
    pub fn lock_options(&self) -> TransitionOptions {
        TransitionOptions {
            lock_ttl: self.lock_ttl(),
            lock_timeout: self.lock_timeout(),
            max_retries: self.transition_max_retries,
        }
    }

    /// Backoff between lock attempts; bounded by the lock timeout, not a count.
    pub fn lock_retry(&self) -> RetryConfig {
        RetryConfig::new(0, self.lock_retry_base_ms, self.lock_retry_max_ms)
    }

    pub fn merge_retry(&self) -> RetryConfig {
        RetryConfig::new(self.merge_max_retries, self.merge_retry_base_ms, self.merge_retry_max_ms)
    }
}

fn parse_ms(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a whole number of milliseconds, got `{value}`")))
}
