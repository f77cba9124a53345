//! Worker pool configuration.
//!
//! Values come from code (`WorkerPoolConfig::new(..).with_*(..)`) or from
//! `TUBEWORKER_*` environment variables via [`WorkerPoolConfig::from_env`].

use std::time::Duration;

use crate::error::ConfigError;
use crate::job::DEFAULT_RELEASE_DELAY_FALLBACK;
use crate::logging::{Logger, TracingLogger};
use crate::policy::ErrorAction;

/// Worker count; zero or negative runs one.
pub const ENV_NUM_WORKERS: &str = "TUBEWORKER_NUM_WORKERS";
/// Reserve timeout in whole seconds.
pub const ENV_RESERVE_TIMEOUT_SECS: &str = "TUBEWORKER_RESERVE_TIMEOUT_SECS";
/// Pause between failed dials, in seconds.
pub const ENV_RECONNECT_DELAY_SECS: &str = "TUBEWORKER_RECONNECT_DELAY_SECS";
/// Pause after deadline-soon, in seconds.
pub const ENV_DEADLINE_SOON_COOLDOWN_SECS: &str = "TUBEWORKER_DEADLINE_SOON_COOLDOWN_SECS";
/// Release delay for jobs reserved with no delay, in seconds.
pub const ENV_RELEASE_DELAY_FALLBACK_SECS: &str = "TUBEWORKER_RELEASE_DELAY_FALLBACK_SECS";
/// `delete`, `release` or `bury`; anything else means release.
pub const ENV_UNMARSHAL_ERROR_ACTION: &str = "TUBEWORKER_UNMARSHAL_ERROR_ACTION";

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of reservation loops. Zero is treated as one; see
    /// [`normalize_num_workers`] for signed sources.
    pub num_workers: usize,
    /// How long a single reserve blocks waiting for a job.
    pub reserve_timeout: Duration,
    /// Pause between failed dial attempts.
    pub reconnect_delay: Duration,
    /// Pause after the server signals deadline-soon.
    pub deadline_soon_cooldown: Duration,
    /// Release delay for jobs that were reserved with no delay.
    pub release_delay_fallback: Duration,
    /// What to do with jobs whose payload does not decode.
    pub unmarshal_error_action: ErrorAction,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            reserve_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            deadline_soon_cooldown: Duration::from_secs(2),
            release_delay_fallback: DEFAULT_RELEASE_DELAY_FALLBACK,
            unmarshal_error_action: ErrorAction::Release,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets how long a single reserve blocks.
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    /// Sets the pause between failed dials.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the pause after a deadline-soon signal.
    pub fn with_deadline_soon_cooldown(mut self, cooldown: Duration) -> Self {
        self.deadline_soon_cooldown = cooldown;
        self
    }

    /// Sets the release delay used for jobs reserved with no delay.
    pub fn with_release_delay_fallback(mut self, delay: Duration) -> Self {
        self.release_delay_fallback = delay;
        self
    }

    /// Sets the action for undecodable payloads.
    pub fn with_unmarshal_error_action(mut self, action: ErrorAction) -> Self {
        self.unmarshal_error_action = action;
        self
    }

    /// Number of loops a run actually starts.
    pub fn effective_num_workers(&self) -> usize {
        self.num_workers.max(1)
    }

    /// Loads the configuration from `TUBEWORKER_*` environment variables,
    /// using defaults for unset ones.
    ///
    /// A worker count of zero or less becomes one. An unknown error action
    /// becomes release and is logged through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable values and
    /// `ConfigError::ValidationFailed` if the result does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), &TracingLogger)
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source and
    /// logger.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        logger: &dyn Logger,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_NUM_WORKERS) {
            config.num_workers = normalize_num_workers(parse_env_value(&val, ENV_NUM_WORKERS)?);
        }

        if let Some(val) = lookup(ENV_RESERVE_TIMEOUT_SECS) {
            config.reserve_timeout = parse_env_secs(&val, ENV_RESERVE_TIMEOUT_SECS)?;
        }

        if let Some(val) = lookup(ENV_RECONNECT_DELAY_SECS) {
            config.reconnect_delay = parse_env_secs(&val, ENV_RECONNECT_DELAY_SECS)?;
        }

        if let Some(val) = lookup(ENV_DEADLINE_SOON_COOLDOWN_SECS) {
            config.deadline_soon_cooldown = parse_env_secs(&val, ENV_DEADLINE_SOON_COOLDOWN_SECS)?;
        }

        if let Some(val) = lookup(ENV_RELEASE_DELAY_FALLBACK_SECS) {
            config.release_delay_fallback = parse_env_secs(&val, ENV_RELEASE_DELAY_FALLBACK_SECS)?;
        }

        if let Some(val) = lookup(ENV_UNMARSHAL_ERROR_ACTION) {
            config.unmarshal_error_action = ErrorAction::from_name_lossy(&val, logger);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A zero timeout turns reserve into a poll and the loop spins.
        if self.reserve_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reserve_timeout must be at least one second".to_string(),
            ));
        }

        if self.reserve_timeout.subsec_nanos() != 0 {
            return Err(ConfigError::ValidationFailed(
                "reserve_timeout must be a whole number of seconds".to_string(),
            ));
        }

        Ok(())
    }
}

/// Maps a configured worker count onto the number of loops to start.
pub fn normalize_num_workers(num_workers: i64) -> usize {
    usize::try_from(num_workers)
        .ok()
        .filter(|&n| n > 0)
        .unwrap_or(1)
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value(value, key).map(Duration::from_secs)
}
