//! Session tokens obtained by logging in against an API's own login endpoint.

use super::{
    AuthOutcome, AuthStrategy, CredentialLocation, credential, lookup_path, render_format,
    scalar_string,
};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, Result};
use crate::token::{TenantContext, TokenInfo};
use apiwire_resilience::redact::{sanitize_reqwest_error, truncate_body};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

const META_LOCATION: &str = "location";
const META_NAME: &str = "name";
const META_FORMAT: &str = "format";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BodyFormat {
    #[default]
    Json,
    Form,
}

fn default_token_path() -> String {
    "token".to_string()
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn default_refresh_field() -> String {
    "refresh_token".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionJwtConfig {
    login_url: String,
    /// Login request body.
    #[serde(default)]
    credentials: Map<String, Value>,
    #[serde(default)]
    body_format: BodyFormat,
    #[serde(default)]
    headers: BTreeMap<String, String>,

    #[serde(default = "default_token_path")]
    token_path: String,
    #[serde(default)]
    refresh_token_path: Option<String>,
    #[serde(default)]
    expires_in_path: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,

    #[serde(default)]
    location: CredentialLocation,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    format: Option<String>,

    #[serde(default)]
    refresh_url: Option<String>,
    #[serde(default = "default_refresh_field")]
    refresh_token_field: String,
}

impl SessionJwtConfig {
    fn name(&self) -> &str {
        match (&self.name, self.location) {
            (Some(n), _) => n.as_str(),
            (None, CredentialLocation::Header) => "Authorization",
            (None, _) => "token",
        }
    }

    /// Headers named `Authorization` carry the token type; everything else the bare token.
    fn format(&self) -> &str {
        match &self.format {
            Some(f) => f.as_str(),
            None if self.location == CredentialLocation::Header
                && self.name().eq_ignore_ascii_case("authorization") =>
            {
                "{tokenType} {token}"
            }
            None => "{token}",
        }
    }

    fn stamp(&self, token: TokenInfo) -> TokenInfo {
        token
            .with_metadata(META_LOCATION, self.location.as_str())
            .with_metadata(META_NAME, self.name())
            .with_metadata(META_FORMAT, self.format())
    }

    /// Extract the token fields from a login or refresh response.
    fn parse(&self, service: &str, body: &Value, previous_refresh: Option<String>) -> Result<TokenInfo> {
        let access = lookup_path(body, &self.token_path)
            .and_then(scalar_string)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::authentication(
                    service,
                    format!("login response has no token at '{}'", self.token_path),
                )
            })?;
        let refresh = self
            .refresh_token_path
            .as_deref()
            .and_then(|p| lookup_path(body, p))
            .and_then(scalar_string)
            .or(previous_refresh);
        let expires_in = self
            .expires_in_path
            .as_deref()
            .and_then(|p| lookup_path(body, p))
            .and_then(scalar_string)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        Ok(self.stamp(
            TokenInfo::new(access, self.token_type.clone())
                .with_refresh_token(refresh)
                .with_expires_in(expires_in),
        ))
    }
}

/// Logs in with configured credentials and replays the session token on each request.
pub struct SessionJwtStrategy {
    http: reqwest::Client,
}

impl SessionJwtStrategy {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post(
        &self,
        service: &str,
        url: &str,
        cfg: &SessionJwtConfig,
        body: &Map<String, Value>,
    ) -> Result<Value> {
        let mut req = self.http.post(url);
        for (k, v) in &cfg.headers {
            req = req.header(k, v);
        }
        req = match cfg.body_format {
            BodyFormat::Json => req.json(body),
            BodyFormat::Form => {
                let pairs: Vec<(&str, String)> = body
                    .iter()
                    .filter_map(|(k, v)| scalar_string(v).map(|s| (k.as_str(), s)))
                    .collect();
                req.form(&pairs)
            }
        };

        let resp = req.send().await.map_err(|e| {
            AuthError::authentication(service, format!("login request failed: {}", sanitize_reqwest_error(&e)))
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            AuthError::authentication(service, format!("login response unreadable: {}", sanitize_reqwest_error(&e)))
        })?;
        if !status.is_success() {
            // Login endpoints may echo submitted credentials.
            let detail = if matches!(status.as_u16(), 401 | 403) {
                "credentials rejected".to_string()
            } else {
                truncate_body(&text)
            };
            return Err(AuthError::authentication(
                service,
                format!("login returned HTTP {}: {detail}", status.as_u16()),
            ));
        }
        serde_json::from_str(&text).map_err(|e| {
            AuthError::with_source(service, "login response is not JSON", e)
        })
    }
}

#[async_trait]
impl AuthStrategy for SessionJwtStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::SessionJwt
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let cfg: SessionJwtConfig = config.typed()?;
        if cfg.login_url.trim().is_empty() {
            return Err(AuthError::Config("'session_jwt' auth requires 'loginUrl'".into()));
        }
        if cfg.token_path.trim().is_empty() {
            return Err(AuthError::Config("'session_jwt' 'tokenPath' must not be empty".into()));
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome> {
        let cfg: SessionJwtConfig = config.typed()?;
        debug!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "session login");
        let body = self
            .post(&ctx.service_name, &cfg.login_url, &cfg, &cfg.credentials)
            .await?;
        Ok(AuthOutcome::Token(cfg.parse(&ctx.service_name, &body, None)?))
    }

    async fn refresh_token(
        &self,
        ctx: &TenantContext,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let cfg: SessionJwtConfig = config.typed()?;
        let service = ctx.service_name.as_str();
        let (Some(url), Some(refresh)) = (cfg.refresh_url.as_deref(), token.refresh_token.as_deref())
        else {
            return Err(AuthError::authentication(service, "session refresh not configured"));
        };

        let mut body = Map::new();
        body.insert(cfg.refresh_token_field.clone(), Value::String(refresh.to_string()));
        debug!(service = %service, tenant = %ctx.tenant_hash, "session refresh");
        let resp = self.post(service, url, &cfg, &body).await?;
        cfg.parse(service, &resp, token.refresh_token.clone())
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<()> {
        // Tokens persisted by an older config still carry their own placement.
        let cfg: Option<SessionJwtConfig> = config.typed().ok();
        let location = token
            .metadata(META_LOCATION)
            .and_then(CredentialLocation::parse)
            .or(cfg.as_ref().map(|c| c.location))
            .unwrap_or_default();
        let name = token
            .metadata(META_NAME)
            .or(cfg.as_ref().map(SessionJwtConfig::name))
            .unwrap_or("Authorization");
        let format = token
            .metadata(META_FORMAT)
            .or(cfg.as_ref().map(SessionJwtConfig::format))
            .unwrap_or("{tokenType} {token}");

        let value = render_format(format, &token.token_type, &token.access_token);
        location.inject(request, name, &value)
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let cfg: SessionJwtConfig = config.typed()?;
        let access = credential(credentials, &["token", "accessToken"])
            .ok_or_else(|| AuthError::Config("'session_jwt' credentials require 'token'".into()))?;
        let refresh = credential(credentials, &["refreshToken"]).map(str::to_string);
        Ok(cfg.stamp(TokenInfo::new(access, cfg.token_type.clone()).with_refresh_token(refresh)))
    }
}
