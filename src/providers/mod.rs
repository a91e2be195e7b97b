//! Provider configuration
//!
//! A provider is described by a fixed [`ProviderConfig`] data record plus a
//! small callback hook selected at registration time — polymorphism over a
//! capability set rather than an inheritance hierarchy. The registry is built
//! once at startup and passed explicitly to the engine and the lifecycle
//! manager; there is no ambient global lookup.

pub mod client;
pub mod registry;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use url::Url;

use crate::config::AppConfig;
use crate::error::HandshakeError;
use client::RawTokenResponse;

/// OAuth protocol version spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthVersion {
    V1,
    V2,
}

/// Static description of a provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Internal name, e.g. "box".
    pub short_name: String,
    /// Human-readable name, e.g. "Box".
    pub display_name: String,
    pub oauth_version: OAuthVersion,
    /// Base URL of the provider's authorization page.
    pub auth_url_base: Url,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub default_scopes: Vec<String>,
    /// Some providers reject an explicit `redirect_uri` query parameter and
    /// resolve the callback server-side instead; those set this to false.
    pub send_redirect_uri: bool,
    pub redirect_uri: Option<Url>,
    /// Seconds before expiry at which a token becomes due for refresh.
    /// 0 means tokens never time-trigger a refresh.
    pub refresh_window_seconds: u64,
    /// Seconds past expiry after which credentials are irrecoverably expired.
    /// 0 means credentials are never considered irrecoverable.
    pub expiry_window_seconds: u64,
}

impl ProviderConfig {
    /// Whether the registry holds enough client credentials to talk to the
    /// provider's token endpoints.
    pub fn has_client_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

/// Identity fields a provider's callback hook extracts from the raw exchange
/// response. The hook is the only per-provider logic the engine invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub provider_account_id: String,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
}

/// Per-provider extension point: pull account identity out of the raw token
/// response.
pub type CallbackHook =
    Arc<dyn Fn(&RawTokenResponse) -> Result<AccountInfo, HandshakeError> + Send + Sync>;

/// Computes the absolute expiry timestamp from a refresh response. Providers
/// with nonstandard refresh bodies override the default.
pub type ExpiryFn = Arc<dyn Fn(&RawTokenResponse) -> Option<DateTime<Utc>> + Send + Sync>;

/// Default expiry computation: `now + expires_in` from the response.
pub fn default_expiry(response: &RawTokenResponse) -> Option<DateTime<Utc>> {
    response
        .expires_in
        .map(|seconds| Utc::now() + Duration::seconds(seconds))
}

/// Build the Box provider description from configuration. Box speaks OAuth2
/// with hourly access tokens and refresh tokens that lapse after long disuse.
pub fn box_provider(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        short_name: "box".to_string(),
        display_name: "Box".to_string(),
        oauth_version: OAuthVersion::V2,
        auth_url_base: Url::parse(&config.box_auth_url).unwrap_or_else(|_| {
            Url::parse("https://account.box.com/api/oauth2/authorize")
                .expect("default Box authorization URL parses")
        }),
        client_id: config.box_client_id.clone(),
        client_secret: config.box_client_secret.clone(),
        default_scopes: vec!["root_readwrite".to_string()],
        send_redirect_uri: true,
        redirect_uri: None,
        refresh_window_seconds: config.box_refresh_window_seconds,
        expiry_window_seconds: config.box_expiry_window_seconds,
    }
}

/// Callback hook for Box: the client attaches the authenticated user record
/// to the raw response under `user`.
pub fn box_callback_hook() -> CallbackHook {
    Arc::new(|response: &RawTokenResponse| {
        let user = response
            .extra
            .get("user")
            .ok_or_else(|| HandshakeError::Hook("no user record in exchange response".to_string()))?;
        let id = user
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| user.get("id").and_then(|v| v.as_i64()).map(|n| n.to_string()))
            .ok_or_else(|| HandshakeError::Hook("user record has no id".to_string()))?;
        let display_name = user
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(AccountInfo {
            profile_url: Some(format!("https://app.box.com/profile/{id}")),
            provider_account_id: id,
            display_name,
        })
    })
}
