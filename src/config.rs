//! Configuration for the resilience layer
//!
//! The utilities never read the environment themselves; applications load a
//! [`ResilienceConfig`] here and pass its parts into constructors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Rate limiting for the AI endpoint
    pub rate_limit: RateLimitConfig,

    /// Retry configuration
    pub retry: RetryConfig,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions allowed per rolling window
    pub max_requests: usize,

    /// Length of the rolling window
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,

    /// Minimum spacing between two admissions
    #[serde(rename = "min_delay_ms", with = "duration_ms")]
    pub min_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_millis(60_000),
            min_delay: Duration::from_millis(6_000),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::Config("max_requests must be at least 1".into()));
        }
        if self.window.is_zero() {
            return Err(Error::Config("window must be non-zero".into()));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,

    /// Base delay, doubled each attempt
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound (exclusive) of the random jitter added to each delay
    #[serde(rename = "max_jitter_ms", with = "duration_ms")]
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2_000),
            max_jitter: Duration::from_millis(1_000),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ResilienceConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
        }
    }

    pub fn max_requests(mut self, max: usize) -> Self {
        self.config.rate_limit.max_requests = max;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.rate_limit.window = window;
        self
    }

    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.config.rate_limit.min_delay = delay;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.config.retry.max_jitter = jitter;
        self
    }

    pub fn build(self) -> Result<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from environment variables, starting from defaults
pub fn from_env() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();

    if let Some(v) = env_parse::<usize>("STYLIST_RATE_LIMIT_MAX_REQUESTS") {
        config.rate_limit.max_requests = v;
    }
    if let Some(v) = env_parse::<u64>("STYLIST_RATE_LIMIT_WINDOW_MS") {
        config.rate_limit.window = Duration::from_millis(v);
    }
    if let Some(v) = env_parse::<u64>("STYLIST_RATE_LIMIT_MIN_DELAY_MS") {
        config.rate_limit.min_delay = Duration::from_millis(v);
    }
    if let Some(v) = env_parse::<usize>("STYLIST_RETRY_MAX_RETRIES") {
        config.retry.max_retries = v;
    }
    if let Some(v) = env_parse::<u64>("STYLIST_RETRY_BASE_DELAY_MS") {
        config.retry.base_delay = Duration::from_millis(v);
    }

    config
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ResilienceConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

/// Parse and validate configuration from TOML text
pub fn from_toml_str(contents: &str) -> Result<ResilienceConfig> {
    let config: ResilienceConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
