//! Engine configuration.
//!
//! [`EngineConfig`] is a plain value: built once (from code, JSON or the
//! environment), validated once, then cloned into the parts that need it.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiError, DiResult};
use crate::reliability::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Lifecycle engine settings.
///
/// JSON keys are camelCase and durations are milliseconds:
///
/// ```rust
/// use ferrous_conductor::{BackoffStrategy, EngineConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::from_json(r#"{
///     "maxParallelism": 8,
///     "defaultTimeout": 5000,
///     "retryPolicy": { "strategy": "linear", "maxAttempts": 4, "baseDelay": 50, "maxDelay": 50, "jitter": false },
///     "circuitBreaker": { "failureThreshold": 3, "cooldown": 1000, "maxOpenBeforeQuarantine": 60000 },
///     "abortOnBatchFailure": false
/// }"#).unwrap();
///
/// assert_eq!(config.max_parallelism, 8);
/// assert_eq!(config.default_timeout, Duration::from_secs(5));
/// assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
/// assert!(!config.abort_on_batch_failure);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Upper bound on lifecycle calls running at once
    pub max_parallelism: usize,
    /// Timeout applied to every individual lifecycle call
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    #[serde(rename = "retryPolicy")]
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Stop starting batches once a critical component has failed
    pub abort_on_batch_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            default_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            abort_on_batch_failure: true,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parses and validates a JSON document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> DiResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| DiError::InvalidConfig(format!("malformed JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> DiResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DiError::InvalidConfig(e.to_string()))
    }

    /// Defaults overridden by `{PREFIX}_*` environment variables, e.g.
    /// `CONDUCTOR_MAX_PARALLELISM=8` or `CONDUCTOR_RETRY_STRATEGY=linear`.
    pub fn from_env(prefix: &str) -> DiResult<Self> {
        Self::default().with_overrides(prefix, |name| env::var(name).ok())
    }

    /// Applies `{PREFIX}_*` overrides read through `lookup`.
    ///
    /// Recognized suffixes: `MAX_PARALLELISM`, `DEFAULT_TIMEOUT_MS`,
    /// `RETRY_STRATEGY`, `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_DELAY_MS`,
    /// `RETRY_MAX_DELAY_MS`, `RETRY_JITTER`, `FAILURE_THRESHOLD`,
    /// `COOLDOWN_MS`, `MAX_OPEN_BEFORE_QUARANTINE_MS`,
    /// `ABORT_ON_BATCH_FAILURE`.
    pub fn with_overrides<F>(mut self, prefix: &str, lookup: F) -> DiResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = prefix.to_uppercase();
        let var = |suffix: &str| lookup(&format!("{}_{}", prefix, suffix));

        if let Some(v) = var("MAX_PARALLELISM") {
            self.max_parallelism = parse(&v, "MAX_PARALLELISM")?;
        }
        if let Some(v) = var("DEFAULT_TIMEOUT_MS") {
            self.default_timeout = Duration::from_millis(parse(&v, "DEFAULT_TIMEOUT_MS")?);
        }
        if let Some(v) = var("RETRY_STRATEGY") {
            self.retry.strategy = match v.to_lowercase().as_str() {
                "immediate" => BackoffStrategy::Immediate,
                "linear" => BackoffStrategy::Linear,
                "exponential" => BackoffStrategy::Exponential,
                other => {
                    return Err(DiError::InvalidConfig(format!(
                        "unknown retry strategy {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse(&v, "RETRY_MAX_ATTEMPTS")?;
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay = Duration::from_millis(parse(&v, "RETRY_BASE_DELAY_MS")?);
        }
        if let Some(v) = var("RETRY_MAX_DELAY_MS") {
            self.retry.max_delay = Duration::from_millis(parse(&v, "RETRY_MAX_DELAY_MS")?);
        }
        if let Some(v) = var("RETRY_JITTER") {
            self.retry.jitter = parse(&v, "RETRY_JITTER")?;
        }
        if let Some(v) = var("FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = parse(&v, "FAILURE_THRESHOLD")?;
        }
        if let Some(v) = var("COOLDOWN_MS") {
            self.circuit_breaker.cooldown = Duration::from_millis(parse(&v, "COOLDOWN_MS")?);
        }
        if let Some(v) = var("MAX_OPEN_BEFORE_QUARANTINE_MS") {
            self.circuit_breaker.max_open_before_quarantine =
                Duration::from_millis(parse(&v, "MAX_OPEN_BEFORE_QUARANTINE_MS")?);
        }
        if let Some(v) = var("ABORT_ON_BATCH_FAILURE") {
            self.abort_on_batch_failure = parse(&v, "ABORT_ON_BATCH_FAILURE")?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> DiResult<()> {
        if self.max_parallelism == 0 {
            return Err(DiError::InvalidConfig("maxParallelism must be at least 1".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(DiError::InvalidConfig("defaultTimeout must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(DiError::InvalidConfig("retryPolicy.maxAttempts must be at least 1".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(DiError::InvalidConfig(
                "retryPolicy.baseDelay exceeds retryPolicy.maxDelay".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(DiError::InvalidConfig(
                "circuitBreaker.failureThreshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str, name: &str) -> DiResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DiError::InvalidConfig(format!("cannot parse {} from {:?}", name, value)))
}

/// Fluent construction of an [`EngineConfig`].
///
/// ```rust
/// use ferrous_conductor::{BackoffStrategy, EngineConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::builder()
///     .max_parallelism(8)
///     .default_timeout(Duration::from_secs(2))
///     .retry_strategy(BackoffStrategy::Immediate)
///     .max_attempts(1)
///     .failure_threshold(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.circuit_breaker.failure_threshold, 3);
///
/// assert!(EngineConfig::builder().max_parallelism(0).build().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn max_parallelism(mut self, value: usize) -> Self {
        self.config.max_parallelism = value;
        self
    }

    pub fn default_timeout(mut self, value: Duration) -> Self {
        self.config.default_timeout = value;
        self
    }

    pub fn retry(mut self, value: RetryConfig) -> Self {
        self.config.retry = value;
        self
    }

    pub fn retry_strategy(mut self, value: BackoffStrategy) -> Self {
        self.config.retry.strategy = value;
        self
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.config.retry.max_attempts = value;
        self
    }

    pub fn base_delay(mut self, value: Duration) -> Self {
        self.config.retry.base_delay = value;
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.config.retry.max_delay = value;
        self
    }

    pub fn jitter(mut self, value: bool) -> Self {
        self.config.retry.jitter = value;
        self
    }

    pub fn circuit_breaker(mut self, value: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = value;
        self
    }

    pub fn failure_threshold(mut self, value: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = value;
        self
    }

    pub fn cooldown(mut self, value: Duration) -> Self {
        self.config.circuit_breaker.cooldown = value;
        self
    }

    pub fn max_open_before_quarantine(mut self, value: Duration) -> Self {
        self.config.circuit_breaker.max_open_before_quarantine = value;
        self
    }

    pub fn abort_on_batch_failure(mut self, value: bool) -> Self {
        self.config.abort_on_batch_failure = value;
        self
    }

    pub fn build(self) -> DiResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
