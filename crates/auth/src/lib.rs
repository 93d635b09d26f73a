//! Multi-tenant credential lifecycle for outbound API calls.
//!
//! [`MultiTenantAuthManager`] resolves a credential per (tenant, service) through a
//! cache → refresh → authenticate waterfall, places it on outbound requests through the
//! configured [`AuthStrategy`], evicts it on invalidating responses, and provisions
//! tenant-specific secrets through single-use auth codes.

pub mod auth_code;
pub mod config;
pub mod error;
pub mod manager;
pub mod store;
pub mod strategies;
pub mod token;

pub use auth_code::{AuthCodeEnvelope, AuthCodeGrant, DEFAULT_AUTH_CODE_TTL};
pub use config::{AuthConfig, AuthType, TokenInvalidationConfig};
pub use error::{AuthError, DeviceCodeError, OAuthErrorCode, Result};
pub use manager::{AuthManagerOptions, DEFAULT_REFRESH_BUFFER, MultiTenantAuthManager};
pub use store::{KvStore, MemoryKvStore, TokenStore};
pub use strategies::{AuthOutcome, AuthStrategy, CredentialLocation};
pub use token::{TenantContext, TokenInfo, TokenKey, hash_tenant_secret};
