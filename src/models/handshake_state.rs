//! Pending handshake state
//!
//! Transient record of an in-flight OAuth dance, one per `(actor, provider)`.
//! Created when the authorization URL is generated, consumed when the
//! callback completes, swept when the TTL lapses. Never persisted beyond the
//! handshake window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::OwnerId;

/// Key under which pending state is stored: one slot per actor and provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeKey {
    pub actor_id: OwnerId,
    pub provider: String,
}

impl HandshakeKey {
    pub fn new(actor_id: OwnerId, provider: impl Into<String>) -> Self {
        Self {
            actor_id,
            provider: provider.into(),
        }
    }
}

/// Protocol-specific pending credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "oauth_version", rename_all = "snake_case")]
pub enum PendingCredentials {
    /// OAuth2: the CSRF `state` echoed back by the provider.
    OAuth2 { state: String },
    /// OAuth1: the temporary request token pair fetched from the provider.
    OAuth1 {
        request_token: String,
        request_token_secret: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeState {
    pub credentials: PendingCredentials,
    pub created_at: DateTime<Utc>,
}

impl HandshakeState {
    pub fn oauth2(state: impl Into<String>) -> Self {
        Self {
            credentials: PendingCredentials::OAuth2 {
                state: state.into(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn oauth1(request_token: impl Into<String>, request_token_secret: impl Into<String>) -> Self {
        Self {
            credentials: PendingCredentials::OAuth1 {
                request_token: request_token.into(),
                request_token_secret: request_token_secret.into(),
            },
            created_at: Utc::now(),
        }
    }
}
