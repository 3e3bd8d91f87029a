//! Configuration for sentinel connectivity, pooling and resilience.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::CounterError;

/// Main configuration for the store manager. All fields are fixed at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Sentinel endpoints as `host:port`.
    pub sentinels: Vec<String>,
    /// Logical name of the monitored primary.
    pub master_name: String,
    /// Password sent with AUTH after connecting to the primary.
    pub password: Option<String>,
    /// Negotiate TLS towards the primary.
    pub tls_enabled: bool,
    /// Per-command timeout (default: 2s).
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,
    /// Connection pool sizing.
    pub pool: PoolConfig,
    /// Retry policy applied to every execution.
    pub retry: RetryPolicy,
    /// Circuit-breaker policy applied to every execution.
    pub breaker: BreakerPolicy,
    /// Time-to-live attached to idempotency markers so they outlive the
    /// retry window and are then reclaimed. `None` disables expiry.
    #[serde(with = "opt_duration_millis")]
    pub marker_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            sentinels: Vec::new(),
            master_name: String::new(),
            password: None,
            tls_enabled: false,
            command_timeout: Duration::from_secs(2),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            marker_ttl: Some(Duration::from_secs(24 * 3600)),
        }
    }
}

impl StoreConfig {
    /// Config for tests: single placeholder sentinel, small pool, fast
    /// retries, breaker that trips quickly.
    pub fn test() -> Self {
        StoreConfig {
            sentinels: vec!["127.0.0.1:26379".to_string()],
            master_name: "primary".to_string(),
            command_timeout: Duration::from_millis(250),
            pool: PoolConfig::test(),
            retry: RetryPolicy::test(),
            breaker: BreakerPolicy::test(),
            marker_ttl: Some(Duration::from_secs(60)),
            ..StoreConfig::default()
        }
    }

    /// Validate the parts every deployment needs, independent of the
    /// connection provider in use.
    pub(crate) fn validate_common(&self) -> Result<(), CounterError> {
        self.pool.validate()?;
        self.retry.validate()?;
        self.breaker.validate()?;
        if self.command_timeout.is_zero() {
            return Err(CounterError::Config(
                "command timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate sentinel addressing on top of the common checks.
    pub(crate) fn validate_for_sentinel(&self) -> Result<(), CounterError> {
        self.validate_common()?;
        if self.sentinels.is_empty() {
            return Err(CounterError::Config(
                "at least one sentinel endpoint is required".to_string(),
            ));
        }
        for endpoint in &self.sentinels {
            split_host_port(endpoint).ok_or_else(|| {
                CounterError::Config(format!("invalid sentinel endpoint: {endpoint}"))
            })?;
        }
        if self.master_name.trim().is_empty() {
            return Err(CounterError::Config(
                "master name must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split a `host:port` endpoint. IPv6 literals are not supported by the
/// sentinel URI form.
pub(crate) fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse::<u16>().ok().map(|p| (host, p))
}

/// Connection pool sizing and fairness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    /// Longest a borrow may wait before failing.
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 50,
            max_idle: 20,
            min_idle: 5,
            max_wait: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn test() -> Self {
        PoolConfig {
            max_total: 4,
            max_idle: 2,
            min_idle: 0,
            max_wait: Duration::from_millis(250),
        }
    }

    fn validate(&self) -> Result<(), CounterError> {
        if self.max_total == 0 {
            return Err(CounterError::Config(
                "pool max_total must be at least 1".to_string(),
            ));
        }
        if self.max_idle > self.max_total {
            return Err(CounterError::Config(
                "pool max_idle must not exceed max_total".to_string(),
            ));
        }
        if self.min_idle > self.max_idle {
            return Err(CounterError::Config(
                "pool min_idle must not exceed max_idle".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed-wait retry applied to every store execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    #[serde(with = "duration_millis")]
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            wait: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn test() -> Self {
        RetryPolicy {
            attempts: 3,
            wait: Duration::from_millis(5),
        }
    }

    fn validate(&self) -> Result<(), CounterError> {
        if self.attempts == 0 {
            return Err(CounterError::Config(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Count-based sliding-window circuit breaker policy.
///
/// The breaker opens when, over the last `window_size` calls (once at least
/// `minimum_calls` were seen), the failure rate or the slow-call rate
/// reaches 50%. While open, calls fail fast; after `open_duration` it
/// half-opens and admits `half_open_trials` probe calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerPolicy {
    pub failure_rate_threshold: f64,
    pub slow_call_rate_threshold: f64,
    /// A successful call slower than this still counts against the breaker.
    #[serde(with = "duration_millis")]
    pub slow_call_threshold: Duration,
    pub minimum_calls: usize,
    pub window_size: usize,
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,
    pub half_open_trials: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        BreakerPolicy {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_threshold: Duration::from_secs(2),
            minimum_calls: 10,
            window_size: 10,
            open_duration: Duration::from_secs(30),
            half_open_trials: 3,
        }
    }
}

impl BreakerPolicy {
    pub fn test() -> Self {
        BreakerPolicy {
            slow_call_threshold: Duration::from_millis(100),
            open_duration: Duration::from_millis(50),
            ..BreakerPolicy::default()
        }
    }

    fn validate(&self) -> Result<(), CounterError> {
        if self.window_size == 0 || self.minimum_calls == 0 {
            return Err(CounterError::Config(
                "breaker window and minimum calls must be at least 1".to_string(),
            ));
        }
        if self.minimum_calls > self.window_size {
            return Err(CounterError::Config(
                "breaker minimum_calls must not exceed window_size".to_string(),
            ));
        }
        if self.half_open_trials == 0 {
            return Err(CounterError::Config(
                "breaker half_open_trials must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Option<Duration> as milliseconds.
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.pool.max_total, 50);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.breaker.minimum_calls, 10);
        assert_eq!(config.marker_ttl, Some(Duration::from_secs(24 * 3600)));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = StoreConfig::test();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.command_timeout, config.command_timeout);
        assert_eq!(parsed.pool.max_total, config.pool.max_total);
        assert_eq!(parsed.marker_ttl, config.marker_ttl);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("sentinel-1:26379"), Some(("sentinel-1", 26379)));
        assert_eq!(split_host_port("127.0.0.1:26379"), Some(("127.0.0.1", 26379)));
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port(":26379"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn test_sentinel_validation() {
        let mut config = StoreConfig::test();
        assert!(config.validate_for_sentinel().is_ok());

        config.sentinels = vec!["bogus".to_string()];
        assert!(config.validate_for_sentinel().is_err());

        config.sentinels = Vec::new();
        assert!(config.validate_for_sentinel().is_err());
    }

    #[test]
    fn test_pool_validation() {
        let mut config = StoreConfig::test();
        config.pool.max_idle = config.pool.max_total + 1;
        assert!(config.validate_common().is_err());

        let mut config = StoreConfig::test();
        config.retry.attempts = 0;
        assert!(config.validate_common().is_err());
    }
}
