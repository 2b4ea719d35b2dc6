//! Consumer configuration

use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Broker consumer configuration.
///
/// Built from [`ConsumerConfig::from_env`] in the binary; tests and
/// embedders use the builder.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Client identifier reported to the broker
    pub client_id: String,

    /// Consumer group ID
    pub group_id: String,

    /// Topic to consume from
    pub topic: String,

    /// Per-batch concurrency ceiling
    pub max_concurrency: usize,

    /// Maximum number of messages collected into one batch
    pub batch_size: usize,

    /// How long a partially filled batch waits for more messages
    pub batch_timeout: Duration,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Interval between liveness probes
    pub health_check_interval: Duration,

    /// Connection attempts before startup fails fatally
    pub max_connect_attempts: u32,

    /// Backoff policy shared by message retries and connect retries
    pub retry_policy: RetryPolicy,

    /// Topic validated messages are mirrored to for debugging, if any
    pub mirror_topic: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "fleetwatch".to_string(),
            group_id: "fleetwatch-telemetry".to_string(),
            topic: "vehicle-telemetry".to_string(),
            max_concurrency: 10,
            batch_size: 100,
            batch_timeout: Duration::from_millis(250),
            session_timeout_ms: 30_000,
            health_check_interval: Duration::from_secs(30),
            max_connect_attempts: 5,
            retry_policy: RetryPolicy::default(),
            mirror_topic: None,
        }
    }
}

impl ConsumerConfig {
    /// Creates a config builder.
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Reads the configuration from `FLEETWATCH_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(brokers) = read_env("FLEETWATCH_BROKERS") {
            config.brokers = brokers;
        }
        if let Some(client_id) = read_env("FLEETWATCH_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = read_env("FLEETWATCH_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(topic) = read_env("FLEETWATCH_TOPIC") {
            config.topic = topic;
        }
        if let Some(limit) = parse_env("FLEETWATCH_MAX_CONCURRENCY")? {
            config.max_concurrency = limit;
        }
        if let Some(size) = parse_env("FLEETWATCH_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(millis) = parse_env::<u64>("FLEETWATCH_BATCH_TIMEOUT_MS")? {
            config.batch_timeout = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_env("FLEETWATCH_SESSION_TIMEOUT_MS")? {
            config.session_timeout_ms = millis;
        }
        if let Some(millis) = parse_env::<u64>("FLEETWATCH_HEALTH_CHECK_INTERVAL_MS")? {
            config.health_check_interval = Duration::from_millis(millis);
        }
        if let Some(attempts) = parse_env("FLEETWATCH_MAX_CONNECT_ATTEMPTS")? {
            config.max_connect_attempts = attempts;
        }
        if let Some(attempts) = parse_env("FLEETWATCH_RETRY_MAX_ATTEMPTS")? {
            config.retry_policy.max_attempts = attempts;
        }
        if let Some(millis) = parse_env::<u64>("FLEETWATCH_RETRY_BASE_DELAY_MS")? {
            config.retry_policy.base_delay = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_env::<u64>("FLEETWATCH_RETRY_MAX_DELAY_MS")? {
            config.retry_policy.max_delay = Duration::from_millis(millis);
        }
        config.mirror_topic = read_env("FLEETWATCH_MIRROR_TOPIC");

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id.is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.topic.is_empty() {
            return Err("Topic cannot be empty".to_string());
        }

        if self.max_concurrency == 0 {
            return Err("Concurrency limit must be greater than 0".to_string());
        }

        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.batch_timeout.is_zero() {
            return Err("Batch timeout must be greater than 0".to_string());
        }

        if self.max_connect_attempts == 0 {
            return Err("Connect attempts must be greater than 0".to_string());
        }

        if self.retry_policy.max_attempts == 0 {
            return Err("Retry attempts must be greater than 0".to_string());
        }

        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err("Base retry delay cannot exceed the maximum delay".to_string());
        }

        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_env(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err| format!("{key} is invalid: {err}")),
        None => Ok(None),
    }
}

/// Builder for [`ConsumerConfig`].
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Creates a builder seeded with defaults.
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses.
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    /// Set the client identifier.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the consumer group ID.
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Set the topic to consume.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    /// Set the per-batch concurrency ceiling.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = limit;
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the batch collection timeout.
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    /// Set the liveness probe interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set the number of startup connection attempts.
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connect_attempts = attempts;
        self
    }

    /// Set the retry backoff policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Set the debug mirror topic.
    pub fn mirror_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.mirror_topic = Some(topic.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
