//! Provider client capability
//!
//! The abstract surface the broker needs from a provider's token endpoints:
//! exchange an authorization artifact for tokens, refresh a token, revoke a
//! token. One implementation per provider; the wire protocol is the
//! implementation's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;

/// A provider's token-endpoint response, normalized only as far as naming the
/// well-known fields. Every field is optional — absence is meaningful and is
/// never collapsed into an empty string. The full raw body rides along in
/// `extra` for the provider's callback hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_token_secret: Option<String>,
    /// Relative lifetime in seconds, as most OAuth2 providers report it.
    pub expires_in: Option<i64>,
    /// Absolute expiry, when the provider reports one directly.
    pub expires_at: Option<DateTime<Utc>>,
    /// Space- or comma-delimited granted scopes.
    pub scope: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl RawTokenResponse {
    /// Granted scopes split into an ordered list.
    pub fn scopes(&self) -> Option<Vec<String>> {
        self.scope.as_ref().map(|raw| {
            raw.split(|c: char| c == ' ' || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Temporary OAuth1 request credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTokenPair {
    pub request_token: String,
    pub request_token_secret: String,
}

/// Artifacts handed to the token exchange.
#[derive(Debug, Clone)]
pub enum ExchangeParams {
    /// OAuth2: authorization code from the callback.
    AuthorizationCode {
        code: String,
        redirect_uri: Option<Url>,
    },
    /// OAuth1: the pending request token pair plus the callback verifier.
    RequestToken {
        request_token: String,
        request_token_secret: String,
        verifier: String,
    },
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch temporary request credentials to start an OAuth1 dance.
    /// OAuth2-only providers keep the default.
    async fn begin_oauth1(&self) -> Result<RequestTokenPair, TransportError> {
        Err(TransportError::Rejected {
            code: "unsupported_flow".to_string(),
            detail: "provider does not speak OAuth1".to_string(),
        })
    }

    /// Exchange an authorization artifact for tokens.
    async fn exchange(&self, params: ExchangeParams) -> Result<RawTokenResponse, TransportError>;

    /// Trade a refresh token for a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> Result<RawTokenResponse, TransportError>;

    /// Ask the provider to drop its side of the grant.
    async fn revoke(&self, token: &str) -> Result<(), TransportError>;
}
