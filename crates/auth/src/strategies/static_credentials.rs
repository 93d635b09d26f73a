//! Bearer, API key and HTTP Basic: credentials known up front, no network round trip.

use super::{
    AuthOutcome, AuthStrategy, CredentialLocation, credential, provisioning_required,
    set_authorization,
};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, Result};
use crate::token::{DEFAULT_TOKEN_TYPE, TenantContext, TokenInfo};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use std::collections::HashMap;

const META_LOCATION: &str = "location";
const META_NAME: &str = "name";
const META_PREFIX: &str = "prefix";
const META_USERNAME: &str = "username";
const META_PASSWORD: &str = "password";

const API_KEY_DEFAULT_PREFIX: &str = "ApiKey";

fn required(value: Option<&str>, auth_type: AuthType, field: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::Config(format!("'{auth_type}' auth requires '{field}'")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BearerConfig {
    #[serde(default)]
    token: Option<String>,
}

/// `Authorization: Bearer <token>`.
pub struct BearerStrategy {
    multi_tenant: bool,
}

impl BearerStrategy {
    #[must_use]
    pub fn new(multi_tenant: bool) -> Self {
        Self { multi_tenant }
    }
}

#[async_trait]
impl AuthStrategy for BearerStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::Bearer
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let cfg: BearerConfig = config.typed()?;
        if !self.multi_tenant {
            required(cfg.token.as_deref(), AuthType::Bearer, "token")?;
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome> {
        if self.multi_tenant {
            return Err(provisioning_required(ctx, AuthType::Bearer));
        }
        let cfg: BearerConfig = config.typed()?;
        let token = required(cfg.token.as_deref(), AuthType::Bearer, "token")?;
        Ok(AuthOutcome::Token(TokenInfo::new(token, DEFAULT_TOKEN_TYPE)))
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<()> {
        set_authorization(request, &format!("Bearer {}", token.access_token))
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        _config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let token = required(
            credential(credentials, &["token", "accessToken", "access_token"]),
            AuthType::Bearer,
            "token",
        )?;
        Ok(TokenInfo::new(token, DEFAULT_TOKEN_TYPE))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyConfig {
    #[serde(default, alias = "key")]
    api_key: Option<String>,
    #[serde(default)]
    location: CredentialLocation,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
}

impl ApiKeyConfig {
    /// Without a custom name the key goes to `Authorization: ApiKey <key>`.
    fn token(&self, key: String) -> TokenInfo {
        let mut token = TokenInfo::new(key, API_KEY_DEFAULT_PREFIX)
            .with_metadata(META_LOCATION, self.location.as_str());
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            token = token.with_metadata(META_NAME, name.trim());
        }
        if let Some(prefix) = &self.prefix {
            token = token.with_metadata(META_PREFIX, prefix.clone());
        }
        token
    }
}

pub struct ApiKeyStrategy {
    multi_tenant: bool,
}

impl ApiKeyStrategy {
    #[must_use]
    pub fn new(multi_tenant: bool) -> Self {
        Self { multi_tenant }
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::ApiKey
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let cfg: ApiKeyConfig = config.typed()?;
        if !self.multi_tenant {
            required(cfg.api_key.as_deref(), AuthType::ApiKey, "apiKey")?;
        }
        if cfg.location != CredentialLocation::Header && cfg.name.is_none() {
            return Err(AuthError::Config(format!(
                "'api_key' auth in {} requires 'name'",
                cfg.location.as_str()
            )));
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome> {
        if self.multi_tenant {
            return Err(provisioning_required(ctx, AuthType::ApiKey));
        }
        let cfg: ApiKeyConfig = config.typed()?;
        let key = required(cfg.api_key.as_deref(), AuthType::ApiKey, "apiKey")?;
        Ok(AuthOutcome::Token(cfg.token(key)))
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<()> {
        let location = token
            .metadata(META_LOCATION)
            .and_then(CredentialLocation::parse)
            .unwrap_or_default();
        let name = token.metadata(META_NAME);
        let prefix = token.metadata(META_PREFIX);

        match (location, name) {
            (CredentialLocation::Header, None) => {
                let prefix = prefix.unwrap_or(API_KEY_DEFAULT_PREFIX);
                set_authorization(request, &with_prefix(prefix, &token.access_token))
            }
            (location, name) => {
                let name = name.unwrap_or("Authorization");
                let value = with_prefix(prefix.unwrap_or_default(), &token.access_token);
                location.inject(request, name, &value)
            }
        }
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let cfg: ApiKeyConfig = config.typed()?;
        let key = required(
            credential(credentials, &["apiKey", "api_key", "key"]),
            AuthType::ApiKey,
            "apiKey",
        )?;
        Ok(cfg.token(key))
    }
}

fn with_prefix(prefix: &str, value: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        value.to_string()
    } else {
        format!("{prefix} {value}")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BasicConfig {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// HTTP Basic. The encoded pair is the access token; the plaintext pair is kept in metadata.
pub struct BasicStrategy {
    multi_tenant: bool,
}

impl BasicStrategy {
    #[must_use]
    pub fn new(multi_tenant: bool) -> Self {
        Self { multi_tenant }
    }

    fn token(username: &str, password: &str) -> TokenInfo {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        TokenInfo::new(encoded, "Basic")
            .with_metadata(META_USERNAME, username)
            .with_metadata(META_PASSWORD, password)
    }
}

#[async_trait]
impl AuthStrategy for BasicStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::Basic
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let cfg: BasicConfig = config.typed()?;
        if !self.multi_tenant {
            required(cfg.username.as_deref(), AuthType::Basic, "username")?;
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome> {
        if self.multi_tenant {
            return Err(provisioning_required(ctx, AuthType::Basic));
        }
        let cfg: BasicConfig = config.typed()?;
        let username = required(cfg.username.as_deref(), AuthType::Basic, "username")?;
        let password = cfg.password.unwrap_or_default();
        Ok(AuthOutcome::Token(Self::token(&username, &password)))
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<()> {
        let encoded = match (token.metadata(META_USERNAME), token.metadata(META_PASSWORD)) {
            (Some(user), pass) => STANDARD.encode(format!("{user}:{}", pass.unwrap_or_default())),
            (None, _) => token.access_token.clone(),
        };
        set_authorization(request, &format!("Basic {encoded}"))
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        _config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let username = required(
            credential(credentials, &["username", "user"]),
            AuthType::Basic,
            "username",
        )?;
        let password = credentials.get("password").cloned().unwrap_or_default();
        Ok(Self::token(&username, &password))
    }
}
