//! Authentication strategies, one per [`AuthType`].

mod device_flow;
mod oauth2;
mod session_jwt;
mod static_credentials;
mod user_credentials;

pub use device_flow::{DEFAULT_MAX_POLL_DURATION, OAuth2DeviceFlowStrategy};
pub use oauth2::OAuth2ExternalStrategy;
pub use session_jwt::SessionJwtStrategy;
pub use static_credentials::{ApiKeyStrategy, BasicStrategy, BearerStrategy};
pub use user_credentials::UserCredentialsStrategy;

use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, DeviceCodeError, Result};
use crate::token::{TenantContext, TokenInfo};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Result of an authenticate step.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Token(TokenInfo),
    /// The user must complete an out-of-band step first (device authorization).
    Pending(DeviceCodeError),
}

/// One authentication mechanism.
///
/// Strategies are stateless with respect to tokens: caching, refresh decisions and invalidation
/// belong to the manager.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn supports_refresh(&self) -> bool {
        false
    }

    /// Fatal configuration checks, run before any network traffic.
    fn validate_config(&self, config: &AuthConfig) -> Result<()>;

    /// Obtain a fresh credential. Prefer [`AuthOutcome::Pending`] for device prompts; an
    /// `authorization_pending` error is passed to the caller untouched.
    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome>;

    async fn refresh_token(
        &self,
        ctx: &TenantContext,
        _token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<TokenInfo> {
        Err(AuthError::authentication(
            ctx.service_name.clone(),
            format!("auth type '{}' does not support refresh", self.auth_type()),
        ))
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<()>;

    /// Turn secrets delivered through out-of-band provisioning into a credential.
    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo>;
}

/// Where a credential is placed on the outbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialLocation {
    #[default]
    Header,
    Cookie,
    Query,
}

impl CredentialLocation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Query => "query",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            "query" => Some(Self::Query),
            _ => None,
        }
    }

    /// Place `name=value` on the request.
    ///
    /// Cookies are appended to any existing `Cookie` header; query parameters are appended to the
    /// URL.
    pub fn inject(self, request: &mut reqwest::Request, name: &str, value: &str) -> Result<()> {
        match self {
            Self::Header => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| AuthError::Config(format!("invalid header name '{name}': {e}")))?;
                request.headers_mut().insert(name, header_value(value)?);
            }
            Self::Cookie => {
                let pair = format!("{name}={value}");
                let merged = match request.headers().get(COOKIE).and_then(|v| v.to_str().ok()) {
                    Some(existing) if !existing.trim().is_empty() => format!("{existing}; {pair}"),
                    _ => pair,
                };
                request.headers_mut().insert(COOKIE, header_value(&merged)?);
            }
            Self::Query => {
                request.url_mut().query_pairs_mut().append_pair(name, value);
            }
        }
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    let mut v = HeaderValue::from_str(value)
        .map_err(|_| AuthError::Config("credential contains invalid header characters".into()))?;
    v.set_sensitive(true);
    Ok(v)
}

pub(crate) fn set_authorization(request: &mut reqwest::Request, value: &str) -> Result<()> {
    request
        .headers_mut()
        .insert(AUTHORIZATION, header_value(value)?);
    Ok(())
}

/// Expand `{tokenType}` / `{token}` placeholders.
#[must_use]
pub fn render_format(format: &str, token_type: &str, token: &str) -> String {
    format
        .replace("{tokenType}", token_type)
        .replace("{token}", token)
}

/// `Authorization` value for OAuth-style tokens. Providers often report `bearer` in lowercase.
pub(crate) fn authorization_value(token: &TokenInfo) -> String {
    let scheme = if token.token_type.is_empty() || token.token_type.eq_ignore_ascii_case("bearer")
    {
        "Bearer"
    } else {
        token.token_type.as_str()
    };
    format!("{scheme} {}", token.access_token)
}

/// Dotted-path lookup into a JSON document (`data.session.token`, `items.0.id`).
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Scalar JSON value as a string; objects, arrays and null yield `None`.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty credential among `keys`.
pub(crate) fn credential<'a>(
    credentials: &'a HashMap<String, String>,
    keys: &[&str],
) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| credentials.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Direct credential input is disabled when the manager serves several tenants.
pub(crate) fn provisioning_required(ctx: &TenantContext, auth_type: AuthType) -> AuthError {
    AuthError::authentication(
        ctx.service_name.clone(),
        format!(
            "'{auth_type}' credentials must be provisioned for this tenant via an auth code"
        ),
    )
}
