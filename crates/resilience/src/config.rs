//! Declarative retry and circuit-breaker settings and their resolved forms.
//!
//! The JSON shapes (`RetrySettings`, `CircuitBreakerSettings`) have every field optional. A call
//! resolves them field by field: endpoint-level > service-level > built-in default.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Retry settings as written in a service or operation description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BackoffStrategy>,
    #[serde(
        default,
        with = "crate::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_delay: Option<Duration>,
    #[serde(
        default,
        with = "crate::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    /// Extra retryable classes: category names (`"client"`, `"auth"`, ...) or status codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

impl RetrySettings {
    /// Field-wise merge: values set on `self` win over `fallback`.
    #[must_use]
    pub fn or(&self, fallback: &Self) -> Self {
        Self {
            enabled: self.enabled.or(fallback.enabled),
            max_attempts: self.max_attempts.or(fallback.max_attempts),
            strategy: self.strategy.or(fallback.strategy),
            base_delay: self.base_delay.or(fallback.base_delay),
            max_delay: self.max_delay.or(fallback.max_delay),
            jitter: self.jitter.or(fallback.jitter),
            backoff_factor: self.backoff_factor.or(fallback.backoff_factor),
            retryable_errors: self
                .retryable_errors
                .clone()
                .or_else(|| fallback.retryable_errors.clone()),
        }
    }
}

/// Fully resolved retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
    pub backoff_factor: f64,
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            strategy: BackoffStrategy::Exponential,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: Some(DEFAULT_MAX_DELAY),
            jitter: false,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Resolve the effective config for one call.
    #[must_use]
    pub fn resolve(endpoint: Option<&RetrySettings>, service: Option<&RetrySettings>) -> Self {
        let empty = RetrySettings::default();
        let merged = endpoint
            .unwrap_or(&empty)
            .or(service.unwrap_or(&empty));
        Self::from_settings(&merged)
    }

    #[must_use]
    pub fn from_settings(s: &RetrySettings) -> Self {
        let d = Self::default();
        Self {
            enabled: s.enabled.unwrap_or(d.enabled),
            max_attempts: s.max_attempts.unwrap_or(d.max_attempts),
            strategy: s.strategy.unwrap_or(d.strategy),
            base_delay: s.base_delay.unwrap_or(d.base_delay),
            max_delay: s.max_delay.or(d.max_delay),
            jitter: s.jitter.unwrap_or(d.jitter),
            backoff_factor: s.backoff_factor.unwrap_or(d.backoff_factor),
            retryable_errors: s.retryable_errors.clone().unwrap_or_default(),
        }
    }

    /// # Errors
    ///
    /// Returns an error for a zero attempt budget or a non-positive backoff factor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("retry.maxAttempts", "must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 0.0 {
            return Err(ConfigError::new(
                "retry.backoffFactor",
                format!("must be a positive number, got {}", self.backoff_factor),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings as written in a service or operation description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<u32>,
    #[serde(
        default,
        with = "crate::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(
        default,
        with = "crate::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset_timeout: Option<Duration>,
}

impl CircuitBreakerSettings {
    #[must_use]
    pub fn or(&self, fallback: &Self) -> Self {
        Self {
            enabled: self.enabled.or(fallback.enabled),
            failure_threshold: self.failure_threshold.or(fallback.failure_threshold),
            success_threshold: self.success_threshold.or(fallback.success_threshold),
            half_open_max_calls: self.half_open_max_calls.or(fallback.half_open_max_calls),
            timeout: self.timeout.or(fallback.timeout),
            reset_timeout: self.reset_timeout.or(fallback.reset_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
    /// Upper bound on a single wrapped invocation. Zero disables the bound.
    pub timeout: Duration,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            timeout: DEFAULT_CALL_TIMEOUT,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn resolve(
        endpoint: Option<&CircuitBreakerSettings>,
        service: Option<&CircuitBreakerSettings>,
    ) -> Self {
        let empty = CircuitBreakerSettings::default();
        let merged = endpoint
            .unwrap_or(&empty)
            .or(service.unwrap_or(&empty));
        Self::from_settings(&merged)
    }

    #[must_use]
    pub fn from_settings(s: &CircuitBreakerSettings) -> Self {
        let d = Self::default();
        Self {
            enabled: s.enabled.unwrap_or(d.enabled),
            failure_threshold: s.failure_threshold.unwrap_or(d.failure_threshold),
            success_threshold: s.success_threshold.unwrap_or(d.success_threshold),
            half_open_max_calls: s.half_open_max_calls.unwrap_or(d.half_open_max_calls),
            timeout: s.timeout.unwrap_or(d.timeout),
            reset_timeout: s.reset_timeout.unwrap_or(d.reset_timeout),
        }
    }

    /// # Errors
    ///
    /// Returns an error if any threshold is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::new(
                "circuitBreaker.failureThreshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::new(
                "circuitBreaker.successThreshold",
                "must be at least 1",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::new(
                "circuitBreaker.halfOpenMaxCalls",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
