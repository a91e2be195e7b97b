//! External account model
//!
//! A credential record for one identity on one provider. The record is not
//! exclusively owned by any single actor; many owners may reference it, and it
//! is destroyed only by explicit deletion. `(provider, provider_account_id)`
//! is unique across all accounts — the repository enforces this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AccountId;
use crate::secrets::SecretField;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub id: AccountId,

    /// Provider short name, e.g. "box". A de facto foreign key into the
    /// provider registry; providers themselves are configuration, not data.
    pub provider: String,

    /// Human-readable provider name, carried for serialization.
    pub provider_display_name: String,

    /// The stable, remote-assigned identifier on the provider.
    pub provider_account_id: String,

    /// For OAuth1 the `oauth_token`; for OAuth2 the `access_token`.
    pub access_token: SecretField,

    /// OAuth1 only: the `oauth_token_secret`.
    pub access_secret: Option<SecretField>,

    /// OAuth2 only.
    pub refresh_token: Option<SecretField>,

    pub expires_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,

    /// The identity's name on the external service.
    pub display_name: Option<String>,
    /// Link to the identity's profile on the external service.
    pub profile_url: Option<String>,
}

impl ExternalAccount {
    /// Whether this account carries the material needed for an OAuth2 refresh.
    pub fn refresh_capable(&self) -> bool {
        self.refresh_token.is_some()
    }
}
