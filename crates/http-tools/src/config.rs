//! Declarative service descriptions.
//!
//! ```json
//! { "services": { "github": {
//!     "baseUrl": "https://api.github.com",
//!     "auth": { "type": "oauth2_device_flow", "config": { ... } },
//!     "retry": { "maxAttempts": 4 },
//!     "operations": { "getUser": { "method": "GET", "path": "/users/{login}" } }
//! } } }
//! ```

use crate::runtime::{OperationError, Result};
use apiwire_auth::AuthConfig;
use apiwire_resilience::{CircuitBreakerConfig, CircuitBreakerSettings, RetryConfig, RetrySettings};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDescription {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    /// Per-request timeout; `0` disables it.
    #[serde(
        default,
        with = "apiwire_resilience::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Declared arguments. Undeclared arguments fill `{placeholders}` in the path, then go to the
    /// query string for GET/HEAD/DELETE and to the JSON body otherwise.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ParamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamConfig {
    #[serde(rename = "in")]
    pub location: ParamLocation,
    /// Wire name, when it differs from the argument name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Defaults to `true` for path parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamConfig {
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
            .unwrap_or(matches!(self.location, ParamLocation::Path))
    }
}

impl ApiDescription {
    /// # Errors
    ///
    /// Returns [`OperationError::Config`] for malformed JSON or an invalid description.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let description: Self = serde_json::from_str(s)
            .map_err(|e| OperationError::Config(format!("invalid API description: {e}")))?;
        description.validate()?;
        Ok(description)
    }

    /// # Errors
    ///
    /// Returns [`OperationError::Config`] if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OperationError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Structural checks. Auth blocks are validated by the auth manager.
    ///
    /// # Errors
    ///
    /// Returns the first problem found as [`OperationError::Config`].
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            service.validate(name)?;
        }
        Ok(())
    }
}

impl ServiceConfig {
    fn validate(&self, service: &str) -> Result<()> {
        Url::parse(&self.base_url).map_err(|e| {
            OperationError::Config(format!("invalid baseUrl '{}' for service '{service}': {e}", self.base_url))
        })?;
        for (op_name, op) in &self.operations {
            op.validate(service, op_name)?;
            self.retry_config(op)
                .validate()
                .map_err(|e| OperationError::Config(format!("{service}.{op_name}: {e}")))?;
            self.circuit_breaker_config(op)
                .validate()
                .map_err(|e| OperationError::Config(format!("{service}.{op_name}: {e}")))?;
        }
        Ok(())
    }

    /// Endpoint settings over service settings over defaults, field by field.
    #[must_use]
    pub fn retry_config(&self, op: &OperationConfig) -> RetryConfig {
        RetryConfig::resolve(op.retry.as_ref(), self.retry.as_ref())
    }

    #[must_use]
    pub fn circuit_breaker_config(&self, op: &OperationConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig::resolve(op.circuit_breaker.as_ref(), self.circuit_breaker.as_ref())
    }
}

impl OperationConfig {
    /// # Errors
    ///
    /// Returns [`OperationError::Config`] for an unknown HTTP method.
    pub fn http_method(&self) -> Result<Method> {
        let m = self.method.trim();
        m.to_uppercase()
            .parse()
            .map_err(|_| OperationError::Config(format!("invalid HTTP method '{m}'")))
    }

    fn validate(&self, service: &str, op_name: &str) -> Result<()> {
        if self.http_method().is_err() {
            return Err(OperationError::Config(format!(
                "{service}.{op_name}: invalid HTTP method '{}'",
                self.method.trim()
            )));
        }
        if self.path.trim().is_empty() {
            return Err(OperationError::Config(format!("{service}.{op_name}: empty path")));
        }

        let mut wire_names = HashSet::new();
        for (arg, p) in &self.params {
            let wire = p.name.as_deref().unwrap_or(arg);
            if !wire_names.insert((p.location, wire)) {
                return Err(OperationError::Config(format!(
                    "{service}.{op_name}: duplicate {:?} parameter '{wire}'",
                    p.location
                )));
            }
            if p.location == ParamLocation::Path && !self.path.contains(&format!("{{{wire}}}")) {
                return Err(OperationError::Config(format!(
                    "{service}.{op_name}: path parameter '{wire}' does not appear in '{}'",
                    self.path
                )));
            }
        }
        Ok(())
    }
}
