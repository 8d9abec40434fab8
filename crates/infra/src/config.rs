//! Outbox relay and sweeper configuration.
//!
//! Values come from defaults, a serde document, or `OUTBOX_*` environment
//! variables, and are checked by [`OutboxConfig::validate`] before anything starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bazaar_core::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid outbox configuration: {0}")]
    Validation(String),
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum rows claimed per tick.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Upper bound for one publish attempt; exceeding it counts as a failure.
    pub attempt_timeout: Duration,
    /// Aggregates dispatched in parallel within one tick.
    pub max_concurrency: usize,
    /// How long claimed rows stay hidden from other relay instances.
    pub lease_duration: Duration,
    /// Lease owner name; generated when unset.
    pub instance_id: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
            max_concurrency: 8,
            lease_duration: Duration::from_secs(60),
            instance_id: None,
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Validation("max_concurrency must be at least 1".into()));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be positive".into()));
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Validation("attempt_timeout must be positive".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Validation(
                "backoff max_delay must not be below base_delay".into(),
            ));
        }
        // A lease shorter than one attempt lets a second instance pick the row
        // up while the first is still publishing it.
        if self.lease_duration <= self.attempt_timeout {
            return Err(ConfigError::Validation(format!(
                "lease_duration ({:?}) must exceed attempt_timeout ({:?})",
                self.lease_duration, self.attempt_timeout
            )));
        }
        if self
            .instance_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::Validation("instance_id must not be blank".into()));
        }
        Ok(())
    }
}

/// Retention sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// `PUBLISHED` rows older than this are deleted.
    pub retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval.is_zero() {
            return Err(ConfigError::Validation("sweeper interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub relay: RelayConfig,
    pub sweeper: SweeperConfig,
}

impl OutboxConfig {
    /// Defaults overridden by `OUTBOX_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OUTBOX_BATCH_SIZE` | `relay.batch_size` |
    /// | `OUTBOX_MAX_RETRIES` | `relay.retry.max_retries` |
    /// | `OUTBOX_BACKOFF_BASE_MS` | `relay.retry.base_delay` |
    /// | `OUTBOX_BACKOFF_MAX_MS` | `relay.retry.max_delay` |
    /// | `OUTBOX_BACKOFF_STRATEGY` | `relay.retry.strategy` (`fixed`, `linear`, `exponential`) |
    /// | `OUTBOX_POLL_INTERVAL_MS` | `relay.poll_interval` |
    /// | `OUTBOX_ATTEMPT_TIMEOUT_MS` | `relay.attempt_timeout` |
    /// | `OUTBOX_MAX_CONCURRENCY` | `relay.max_concurrency` |
    /// | `OUTBOX_LEASE_MS` | `relay.lease_duration` |
    /// | `OUTBOX_INSTANCE_ID` | `relay.instance_id` |
    /// | `OUTBOX_SWEEPER_ENABLED` | `sweeper.enabled` |
    /// | `OUTBOX_SWEEP_INTERVAL_SECS` | `sweeper.interval` |
    /// | `OUTBOX_RETENTION_SECS` | `sweeper.retention` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        let relay = &mut config.relay;
        if let Some(v) = env.parse("OUTBOX_BATCH_SIZE")? {
            relay.batch_size = v;
        }
        if let Some(v) = env.parse("OUTBOX_MAX_RETRIES")? {
            relay.retry.max_retries = v;
        }
        if let Some(v) = env.millis("OUTBOX_BACKOFF_BASE_MS")? {
            relay.retry.base_delay = v;
        }
        if let Some(v) = env.millis("OUTBOX_BACKOFF_MAX_MS")? {
            relay.retry.max_delay = v;
        }
        if let Some(raw) = env.get("OUTBOX_BACKOFF_STRATEGY") {
            relay.retry.strategy = parse_strategy(&raw)
                .ok_or_else(|| invalid("OUTBOX_BACKOFF_STRATEGY", &raw, "expected fixed, linear or exponential"))?;
        }
        if let Some(v) = env.millis("OUTBOX_POLL_INTERVAL_MS")? {
            relay.poll_interval = v;
        }
        if let Some(v) = env.millis("OUTBOX_ATTEMPT_TIMEOUT_MS")? {
            relay.attempt_timeout = v;
        }
        if let Some(v) = env.parse("OUTBOX_MAX_CONCURRENCY")? {
            relay.max_concurrency = v;
        }
        if let Some(v) = env.millis("OUTBOX_LEASE_MS")? {
            relay.lease_duration = v;
        }
        if let Some(v) = env.get("OUTBOX_INSTANCE_ID") {
            relay.instance_id = Some(v);
        }

        let sweeper = &mut config.sweeper;
        if let Some(v) = env.parse("OUTBOX_SWEEPER_ENABLED")? {
            sweeper.enabled = v;
        }
        if let Some(v) = env.parse::<u64>("OUTBOX_SWEEP_INTERVAL_SECS")? {
            sweeper.interval = Duration::from_secs(v);
        }
        if let Some(v) = env.parse::<u64>("OUTBOX_RETENTION_SECS")? {
            sweeper.retention = Duration::from_secs(v);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()?;
        self.sweeper.validate()
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, &raw, e)))
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

fn parse_strategy(raw: &str) -> Option<BackoffStrategy> {
    match raw.to_ascii_lowercase().as_str() {
        "fixed" => Some(BackoffStrategy::Fixed),
        "linear" => Some(BackoffStrategy::Linear),
        "exponential" => Some(BackoffStrategy::Exponential),
        _ => None,
    }
}

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = OutboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.relay.retry.max_retries, 5);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_BATCH_SIZE", "25"),
            ("OUTBOX_MAX_RETRIES", "3"),
            ("OUTBOX_BACKOFF_STRATEGY", "Linear"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_INSTANCE_ID", "relay-eu-1"),
            ("OUTBOX_SWEEPER_ENABLED", "false"),
            ("OUTBOX_RETENTION_SECS", "3600"),
        ]))
        .unwrap();

        assert_eq!(config.relay.batch_size, 25);
        assert_eq!(config.relay.retry.max_retries, 3);
        assert_eq!(config.relay.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(250));
        assert_eq!(config.relay.instance_id.as_deref(), Some("relay-eu-1"));
        assert!(!config.sweeper.enabled);
        assert_eq!(config.sweeper.retention, Duration::from_secs(3600));
        assert_eq!(config.relay.max_concurrency, 8);
    }

    #[test]
    fn unparsable_variable_names_the_key() {
        let err = OutboxConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "OUTBOX_BATCH_SIZE"));
    }

    #[test]
    fn blank_variables_are_ignored() {
        let config = OutboxConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "  ")])).unwrap();
        assert_eq!(config.relay.batch_size, 100);
    }

    #[test]
    fn lease_must_outlast_attempt_timeout() {
        let relay = RelayConfig::default()
            .with_attempt_timeout(Duration::from_secs(30))
            .with_lease_duration(Duration::from_secs(30));
        assert!(matches!(relay.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(RelayConfig::default().with_batch_size(0).validate().is_err());
        assert!(RelayConfig::default().with_max_concurrency(0).validate().is_err());
        assert!(RelayConfig::default().with_max_retries(0).validate().is_err());
        assert!(RelayConfig::default().with_instance_id(" ").validate().is_err());
    }

    #[test]
    fn deserializes_partial_document() {
        let config: OutboxConfig =
            serde_json::from_str(r#"{"relay": {"batch_size": 10}, "sweeper": {"enabled": false}}"#).unwrap();
        assert_eq!(config.relay.batch_size, 10);
        assert_eq!(config.relay.max_concurrency, 8);
        assert!(!config.sweeper.enabled);
    }
}
