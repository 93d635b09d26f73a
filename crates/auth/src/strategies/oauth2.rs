//! OAuth2 token endpoint plumbing and the externally provisioned OAuth2 strategy.

use super::{
    AuthOutcome, AuthStrategy, authorization_value, credential, provisioning_required,
    set_authorization,
};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, OAuthErrorCode, Result};
use crate::token::{DEFAULT_TOKEN_TYPE, TenantContext, TokenInfo};
use apiwire_resilience::redact::{sanitize_reqwest_error, truncate_body};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub(crate) const META_CLIENT_ID: &str = "client_id";
pub(crate) const META_TOKEN_URL: &str = "token_url";

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// RFC 6749 §5.1 success body.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// `previous_refresh` is kept when the endpoint does not rotate refresh tokens.
    pub(crate) fn into_token_info(self, previous_refresh: Option<String>) -> TokenInfo {
        let scope = self
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        TokenInfo::new(
            self.access_token,
            self.token_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
        )
        .with_refresh_token(self.refresh_token.or(previous_refresh))
        .with_expires_in(self.expires_in.map(Duration::from_secs))
        .with_scope(scope)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Why a token endpoint call did not yield a token.
#[derive(Debug)]
pub(crate) enum GrantError {
    /// The endpoint answered with an OAuth `error` body.
    OAuth {
        code: OAuthErrorCode,
        description: Option<String>,
    },
    /// Non-success status without an OAuth error body.
    Http { status: u16, body: String },
    Transport(String),
    Decode(String),
}

impl GrantError {
    pub(crate) fn into_auth_error(self, service: &str) -> AuthError {
        match self {
            Self::OAuth { code, description } => {
                let message = match description {
                    Some(d) => format!("token endpoint returned '{code}': {d}"),
                    None => format!("token endpoint returned '{code}'"),
                };
                AuthError::oauth(service, code, message)
            }
            Self::Http { status, body } => AuthError::authentication(
                service,
                format!("token endpoint returned HTTP {status}: {body}"),
            ),
            Self::Transport(msg) => {
                AuthError::authentication(service, format!("token endpoint unreachable: {msg}"))
            }
            Self::Decode(msg) => {
                AuthError::authentication(service, format!("invalid token response: {msg}"))
            }
        }
    }
}

/// POST a form to an OAuth endpoint and decode the JSON body as `T`.
///
/// Some providers answer errors with HTTP 200, so an `error` field wins over the status.
pub(crate) async fn post_form<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> std::result::Result<T, GrantError> {
    let resp = http
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| GrantError::Transport(sanitize_reqwest_error(&e)))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| GrantError::Transport(sanitize_reqwest_error(&e)))?;

    if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&bytes) {
        return Err(GrantError::OAuth {
            code: OAuthErrorCode::parse(&err.error),
            description: err.error_description,
        });
    }
    if !status.is_success() {
        return Err(GrantError::Http {
            status: status.as_u16(),
            body: truncate_body(&String::from_utf8_lossy(&bytes)),
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| GrantError::Decode(e.to_string()))
}

/// Client settings shared by the OAuth2 strategies. Every field may be overridden per token via
/// metadata recorded at provisioning time.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OAuthClientConfig {
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Standard `refresh_token` grant.
pub(crate) async fn refresh_grant(
    http: &reqwest::Client,
    ctx: &TenantContext,
    token: &TokenInfo,
    client: &OAuthClientConfig,
) -> Result<TokenInfo> {
    let service = ctx.service_name.as_str();
    let Some(refresh_token) = token.refresh_token.as_deref() else {
        return Err(AuthError::authentication(service, "no refresh token"));
    };
    let token_url = token
        .metadata(META_TOKEN_URL)
        .map(str::to_string)
        .or_else(|| client.token_url.clone())
        .ok_or_else(|| AuthError::authentication(service, "no token URL for refresh"))?;
    let client_id = token
        .metadata(META_CLIENT_ID)
        .map(str::to_string)
        .or_else(|| client.client_id.clone());

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(id) = client_id.as_deref() {
        form.push(("client_id", id));
    }
    if let Some(secret) = client.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    debug!(service = %service, tenant = %ctx.tenant_hash, "refreshing OAuth2 token");
    let resp: TokenResponse = post_form(http, &token_url, &form)
        .await
        .map_err(|e| e.into_auth_error(service))?;

    let mut fresh = resp.into_token_info(token.refresh_token.clone());
    fresh.metadata = token.metadata.clone();
    if fresh.scope.is_empty() {
        fresh.scope = token.scope.clone();
    }
    Ok(fresh)
}

/// Build a token from provisioned OAuth2 secrets
/// (`accessToken`, `refreshToken`, `expiresIn` seconds, `tokenType`, `scope`).
pub(crate) fn oauth_token_from_credentials(
    auth_type: AuthType,
    credentials: &HashMap<String, String>,
    client: &OAuthClientConfig,
) -> Result<TokenInfo> {
    let access = credential(credentials, &["accessToken", "access_token"])
        .ok_or_else(|| AuthError::Config(format!("'{auth_type}' credentials require 'accessToken'")))?;
    let refresh = credential(credentials, &["refreshToken", "refresh_token"]).map(str::to_string);
    let expires_in = credential(credentials, &["expiresIn", "expires_in"])
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| AuthError::Config(format!("invalid expiresIn '{v}'")))
        })
        .transpose()?;
    let token_type = credential(credentials, &["tokenType", "token_type"])
        .unwrap_or(DEFAULT_TOKEN_TYPE);
    let scope = credential(credentials, &["scope"])
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_else(|| client.scopes.clone());

    let mut token = TokenInfo::new(access, token_type)
        .with_refresh_token(refresh)
        .with_expires_in(expires_in.map(Duration::from_secs))
        .with_scope(scope);
    let client_id = credential(credentials, &["clientId", "client_id"]).or(client.client_id.as_deref());
    if let Some(id) = client_id {
        token = token.with_metadata(META_CLIENT_ID, id);
    }
    let token_url = credential(credentials, &["tokenUrl", "token_url"]).or(client.token_url.as_deref());
    if let Some(url) = token_url {
        token = token.with_metadata(META_TOKEN_URL, url);
    }
    Ok(token)
}

/// OAuth2 tokens obtained by an external tool and provisioned through an auth code.
pub struct OAuth2ExternalStrategy {
    http: reqwest::Client,
}

impl OAuth2ExternalStrategy {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AuthStrategy for OAuth2ExternalStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2External
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let _: OAuthClientConfig = config.typed()?;
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, _config: &AuthConfig) -> Result<AuthOutcome> {
        Err(provisioning_required(ctx, AuthType::OAuth2External))
    }

    async fn refresh_token(
        &self,
        ctx: &TenantContext,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let client: OAuthClientConfig = config.typed()?;
        refresh_grant(&self.http, ctx, token, &client).await
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<()> {
        set_authorization(request, &authorization_value(token))
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let client: OAuthClientConfig = config.typed()?;
        oauth_token_from_credentials(AuthType::OAuth2External, credentials, &client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiwire_test_support::MockServer;
    use axum::{Form, Json, Router, routing::post};
    use serde_json::json;

    fn ctx() -> TenantContext {
        TenantContext::new("tenant", "crm")
    }

    #[tokio::test]
    async fn authenticate_requires_provisioning() {
        let strategy = OAuth2ExternalStrategy::new(reqwest::Client::new());
        let config = AuthConfig::new(AuthType::OAuth2External, json!({}));
        let err = strategy.authenticate(&ctx(), &config).await.unwrap_err();
        assert!(matches!(err, AuthError::Authentication { .. }));
    }

    #[test]
    fn provisioned_credentials_carry_refresh_metadata() {
        let strategy = OAuth2ExternalStrategy::new(reqwest::Client::new());
        let config = AuthConfig::new(
            AuthType::OAuth2External,
            json!({ "tokenUrl": "https://auth.example.com/token", "clientId": "cid" }),
        );
        let creds = HashMap::from([
            ("accessToken".to_string(), "at".to_string()),
            ("refreshToken".to_string(), "rt".to_string()),
            ("expiresIn".to_string(), "3600".to_string()),
            ("scope".to_string(), "read write".to_string()),
        ]);
        let token = strategy
            .token_from_credentials(&creds, &config)
            .expect("token");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
        assert_eq!(token.scope, vec!["read", "write"]);
        assert_eq!(token.metadata("client_id"), Some("cid"));
        assert_eq!(
            token.metadata("token_url"),
            Some("https://auth.example.com/token")
        );
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_when_not_rotated() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
                assert_eq!(form.get("refresh_token").map(String::as_str), Some("rt-1"));
                assert_eq!(form.get("client_id").map(String::as_str), Some("cid"));
                Json(json!({ "access_token": "at-2", "token_type": "bearer", "expires_in": "60" }))
            }),
        );
        let server = MockServer::start(app).await;

        let strategy = OAuth2ExternalStrategy::new(reqwest::Client::new());
        let config = AuthConfig::new(AuthType::OAuth2External, json!({}));
        let old = TokenInfo::new("at-1", "Bearer")
            .with_refresh_token(Some("rt-1".to_string()))
            .with_metadata(META_CLIENT_ID, "cid")
            .with_metadata(META_TOKEN_URL, server.url("/token"));

        let fresh = strategy
            .refresh_token(&ctx(), &old, &config)
            .await
            .expect("refresh");
        assert_eq!(fresh.access_token, "at-2");
        assert_eq!(fresh.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(fresh.metadata, old.metadata);
        assert!(fresh.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_surfaces_oauth_error_code() {
        let app = Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant", "error_description": "revoked" })),
                )
            }),
        );
        let server = MockServer::start(app).await;

        let strategy = OAuth2ExternalStrategy::new(reqwest::Client::new());
        let config = AuthConfig::new(
            AuthType::OAuth2External,
            json!({ "tokenUrl": server.url("/token") }),
        );
        let old = TokenInfo::new("at-1", "Bearer").with_refresh_token(Some("rt-1".to_string()));
        let err = strategy
            .refresh_token(&ctx(), &old, &config)
            .await
            .unwrap_err();
        assert_eq!(err.oauth_reason(), Some(&OAuthErrorCode::InvalidGrant));
    }
}
