use std::time::Duration;

use thiserror::Error;

use crate::backoff::Backoff;
use crate::constants::DEFAULT_WAYBACK_ENDPOINT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as number: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Wayback Machine
    pub wayback_endpoint: String,
    pub wayback_access_key: Option<String>,
    pub wayback_secret_key: Option<String>,
    pub http_timeout: Duration,

    // Dedup
    pub freshness_window: Duration,

    // Scheduling
    pub chunk_size: usize,
    pub poll_concurrency: usize,
    pub max_resubmits: u32,

    // Retry policy
    pub submit_initial_wait: Duration,
    pub submit_max_wait: Duration,
    pub backoff_multiplier: f64,
    pub poll_initial_wait: Duration,
    pub poll_max_wait: Duration,
    pub poll_timeout: Duration,
    pub transient_wait: Duration,
    pub max_transient_retries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Wayback Machine
            wayback_endpoint: env_or_default("WAYBACK_ENDPOINT", DEFAULT_WAYBACK_ENDPOINT),
            wayback_access_key: optional_env("WAYBACK_ACCESS_KEY"),
            wayback_secret_key: optional_env("WAYBACK_SECRET_KEY"),
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 60)?),

            // Dedup
            freshness_window: Duration::from_secs(
                parse_env_u64("FRESHNESS_WINDOW_HOURS", 20)?
                    .checked_mul(3600)
                    .ok_or_else(|| invalid("FRESHNESS_WINDOW_HOURS", "is too large"))?,
            ),

            // Scheduling
            chunk_size: parse_env_usize("CHUNK_SIZE", 15)?,
            poll_concurrency: parse_env_usize("POLL_CONCURRENCY", 1)?,
            max_resubmits: parse_env_u32("MAX_RESUBMITS", 2)?,

            // Retry policy
            submit_initial_wait: Duration::from_millis(parse_env_u64(
                "SUBMIT_INITIAL_WAIT_MS",
                2000,
            )?),
            submit_max_wait: Duration::from_millis(parse_env_u64("SUBMIT_MAX_WAIT_MS", 300_000)?),
            backoff_multiplier: parse_env_f64("BACKOFF_MULTIPLIER", 1.2)?,
            poll_initial_wait: Duration::from_millis(parse_env_u64("POLL_INITIAL_WAIT_MS", 2000)?),
            poll_max_wait: Duration::from_millis(parse_env_u64("POLL_MAX_WAIT_MS", 9000)?),
            poll_timeout: Duration::from_secs(parse_env_u64("POLL_TIMEOUT_SECS", 60)?),
            transient_wait: Duration::from_secs(parse_env_u64("TRANSIENT_WAIT_SECS", 30)?),
            max_transient_retries: parse_env_u32("MAX_TRANSIENT_RETRIES", 4)?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(invalid("CHUNK_SIZE", "must be at least 1"));
        }
        if self.poll_concurrency == 0 {
            return Err(invalid("POLL_CONCURRENCY", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("BACKOFF_MULTIPLIER", "must be a number >= 1.0"));
        }
        if self.submit_max_wait < self.submit_initial_wait {
            return Err(invalid(
                "SUBMIT_MAX_WAIT_MS",
                "must not be smaller than SUBMIT_INITIAL_WAIT_MS",
            ));
        }
        if self.poll_max_wait < self.poll_initial_wait {
            return Err(invalid(
                "POLL_MAX_WAIT_MS",
                "must not be smaller than POLL_INITIAL_WAIT_MS",
            ));
        }
        if !self.wayback_endpoint.ends_with('/') {
            return Err(invalid("WAYBACK_ENDPOINT", "must end with '/'"));
        }
        if self.wayback_access_key.is_some() != self.wayback_secret_key.is_some() {
            return Err(invalid(
                "WAYBACK_ACCESS_KEY",
                "WAYBACK_ACCESS_KEY and WAYBACK_SECRET_KEY must be set together",
            ));
        }
        Ok(())
    }

    /// Configuration with millisecond waits, pointed at a local endpoint.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            wayback_endpoint: "http://127.0.0.1:9/save/".to_string(),
            wayback_access_key: None,
            wayback_secret_key: None,
            http_timeout: Duration::from_secs(5),
            freshness_window: Duration::from_secs(20 * 3600),
            chunk_size: 15,
            poll_concurrency: 1,
            max_resubmits: 2,
            submit_initial_wait: Duration::from_millis(1),
            submit_max_wait: Duration::from_millis(5),
            backoff_multiplier: 1.2,
            poll_initial_wait: Duration::from_millis(2),
            poll_max_wait: Duration::from_millis(9),
            poll_timeout: Duration::from_millis(60),
            transient_wait: Duration::from_millis(3),
            max_transient_retries: 4,
        }
    }

    /// The `if_not_archived_within` hint sent with every save request.
    #[must_use]
    pub fn freshness_hint(&self) -> String {
        format!("{}h", self.freshness_window.as_secs() / 3600)
    }

    /// Wait policy for HTTP 429 responses to save requests.
    #[must_use]
    pub fn submit_backoff(&self) -> Backoff {
        Backoff::new(
            self.submit_initial_wait,
            self.backoff_multiplier,
            self.submit_max_wait,
        )
    }

    /// Wait policy between status queries of a pending job.
    #[must_use]
    pub fn poll_backoff(&self) -> Backoff {
        Backoff::new(
            self.poll_initial_wait,
            self.backoff_multiplier,
            self.poll_max_wait,
        )
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_config_is_valid() {
        assert!(Config::for_testing().validate().is_ok());
    }

    #[test]
    fn test_freshness_hint() {
        let config = Config::for_testing();
        assert_eq!(config.freshness_hint(), "20h");
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let config = Config {
            chunk_size: 0,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let config = Config {
            backoff_multiplier: 0.5,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_half_credentials() {
        let config = Config {
            wayback_access_key: Some("key".to_string()),
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(parse_env_u64("NONEXISTENT_VAR", 7).unwrap(), 7);
        assert!((parse_env_f64("NONEXISTENT_VAR", 1.2).unwrap() - 1.2).abs() < f64::EPSILON);
    }
}
