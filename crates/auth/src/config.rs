//! Declarative auth configuration: `{type, config: {...}, tokenInvalidation: {...}}`.

use crate::error::{AuthError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_INVALIDATION_STATUS: u16 = 401;
pub const DEFAULT_INVALIDATION_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "bearer")]
    Bearer,
    #[serde(rename = "api_key", alias = "apikey")]
    ApiKey,
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "session_jwt")]
    SessionJwt,
    #[serde(rename = "user_credentials")]
    UserCredentials,
    #[serde(rename = "oauth2_external")]
    OAuth2External,
    #[serde(rename = "oauth2_device_flow", alias = "oauth2_device")]
    OAuth2DeviceFlow,
}

impl AuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::ApiKey => "api_key",
            Self::Basic => "basic",
            Self::SessionJwt => "session_jwt",
            Self::UserCredentials => "user_credentials",
            Self::OAuth2External => "oauth2_external",
            Self::OAuth2DeviceFlow => "oauth2_device_flow",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_status_codes() -> Vec<u16> {
    vec![DEFAULT_INVALIDATION_STATUS]
}

fn default_true() -> bool {
    true
}

/// Which upstream statuses evict the cached credential, and whether to retry once afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInvalidationConfig {
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
    #[serde(default = "default_true")]
    pub retry_on_invalidation: bool,
    #[serde(
        default,
        with = "apiwire_resilience::serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_delay: Option<Duration>,
}

impl Default for TokenInvalidationConfig {
    fn default() -> Self {
        Self {
            status_codes: default_status_codes(),
            retry_on_invalidation: true,
            retry_delay: None,
        }
    }
}

impl TokenInvalidationConfig {
    #[must_use]
    pub fn matches(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    #[must_use]
    pub fn effective_retry_delay(&self) -> Duration {
        self.retry_delay.unwrap_or(DEFAULT_INVALIDATION_RETRY_DELAY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    /// Strategy-specific keys; each strategy parses them into its own typed config.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub token_invalidation: TokenInvalidationConfig,
}

impl AuthConfig {
    #[must_use]
    pub fn new(auth_type: AuthType, config: Value) -> Self {
        Self {
            auth_type,
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            token_invalidation: TokenInvalidationConfig::default(),
        }
    }

    /// Parse the strategy-specific section into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if required keys are missing or have the wrong shape.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|e| {
            AuthError::Config(format!("invalid '{}' auth config: {e}", self.auth_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_declarative_auth_block() {
        let cfg: AuthConfig = serde_json::from_value(json!({
            "type": "oauth2_device_flow",
            "config": { "clientId": "abc" },
            "tokenInvalidation": { "statusCodes": [401, 403], "retryDelay": "250ms" }
        }))
        .expect("auth config");
        assert_eq!(cfg.auth_type, AuthType::OAuth2DeviceFlow);
        assert!(cfg.token_invalidation.matches(403));
        assert!(cfg.token_invalidation.retry_on_invalidation);
        assert_eq!(
            cfg.token_invalidation.effective_retry_delay(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn invalidation_defaults_to_401_with_retry() {
        let cfg: AuthConfig =
            serde_json::from_value(json!({ "type": "bearer" })).expect("auth config");
        assert_eq!(cfg.token_invalidation.status_codes, vec![401]);
        assert!(cfg.token_invalidation.retry_on_invalidation);
        assert_eq!(
            cfg.token_invalidation.effective_retry_delay(),
            DEFAULT_INVALIDATION_RETRY_DELAY
        );
        assert!(!cfg.token_invalidation.matches(500));
    }

    #[test]
    fn type_aliases() {
        let t: AuthType = serde_json::from_value(json!("apikey")).expect("alias");
        assert_eq!(t, AuthType::ApiKey);
        assert_eq!(AuthType::OAuth2External.to_string(), "oauth2_external");
    }
}
