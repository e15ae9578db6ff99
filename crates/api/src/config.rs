//! Service configuration loaded from environment variables.

use std::time::Duration;

use resilience::{CircuitBreakerConfig, IdempotencyConfig, RetryPolicy};
use transport::ConnectionConfig;

/// Service configuration with defaults matching the library defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `RECONNECT_DELAY_MS`, `MAX_RECONNECT_ATTEMPTS`: broker reconnection
/// - `PREFETCH`: unsettled deliveries per participant consumer
/// - `RETRY_MAX`, `RETRY_BASE_DELAY_MS`: handler retry policy
/// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_RESET_TIMEOUT_MS`,
///   `BREAKER_CALL_TIMEOUT_MS`: circuit breaker defaults
/// - `IDEMPOTENCY_RETENTION_SECS`: how long processed keys are remembered
///
/// Unset or unparsable values fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub prefetch: u16,
    pub retry_max: u32,
    pub retry_base_delay: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
    pub breaker_call_timeout: Duration,
    pub idempotency_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        let retry = RetryPolicy::default();
        let breaker = CircuitBreakerConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            reconnect_delay: connection.reconnect_delay,
            max_reconnect_attempts: connection.max_reconnect_attempts,
            prefetch: 1,
            retry_max: retry.max_retries,
            retry_base_delay: retry.base_delay,
            breaker_failure_threshold: breaker.failure_threshold,
            breaker_reset_timeout: breaker.reset_timeout,
            breaker_call_timeout: breaker.call_timeout,
            idempotency_retention: IdempotencyConfig::default().retention,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(d.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(d.port),
            log_level: lookup("RUST_LOG").unwrap_or(d.log_level),
            reconnect_delay: millis("RECONNECT_DELAY_MS", d.reconnect_delay),
            max_reconnect_attempts: lookup("MAX_RECONNECT_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_reconnect_attempts),
            prefetch: lookup("PREFETCH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.prefetch),
            retry_max: lookup("RETRY_MAX")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.retry_max),
            retry_base_delay: millis("RETRY_BASE_DELAY_MS", d.retry_base_delay),
            breaker_failure_threshold: lookup("BREAKER_FAILURE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.breaker_failure_threshold),
            breaker_reset_timeout: millis("BREAKER_RESET_TIMEOUT_MS", d.breaker_reset_timeout),
            breaker_call_timeout: millis("BREAKER_CALL_TIMEOUT_MS", d.breaker_call_timeout),
            idempotency_retention: parse("IDEMPOTENCY_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.idempotency_retention),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max, self.retry_base_delay)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: self.breaker_reset_timeout,
            call_timeout: self.breaker_call_timeout,
        }
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            retention: self.idempotency_retention,
            ..IdempotencyConfig::default()
        }
    }
}
