//! # Error Handling
//!
//! Unified error taxonomy for the broker. Handshake errors are always
//! recoverable by restarting the flow from `begin`; credential errors surface
//! to the caller as "reauthorization required"; authorization errors indicate
//! a caller bug or a tampered request and must not be retried.

use thiserror::Error;

/// Transport-level failure talking to a provider.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The provider call did not complete within the configured deadline.
    #[error("provider call timed out")]
    Timeout,

    /// The provider answered with a definitive rejection (e.g. `invalid_grant`,
    /// an expired authorization code, or a revoked refresh token).
    #[error("provider rejected the request: {code}: {detail}")]
    Rejected { code: String, detail: String },

    /// Connectivity-level failure (DNS, TLS, connection reset, 5xx).
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Rejections with these codes mean the grant itself is dead and a new
    /// handshake is required, as opposed to a retryable hiccup.
    pub fn is_grant_rejection(&self) -> bool {
        match self {
            TransportError::Rejected { code, .. } => {
                let code = code.to_lowercase();
                code.contains("invalid_grant")
                    || code.contains("access_denied")
                    || code.contains("expired_token")
                    || code.contains("unauthorized_client")
            }
            _ => false,
        }
    }
}

/// Errors raised while driving an OAuth handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No pending handshake exists for this `(actor, provider)` pair.
    #[error("handshake flow not recognized")]
    NotFound,

    /// OAuth2 callback carried a `state` that does not match the pending one.
    #[error("callback state does not match the pending handshake")]
    StateMismatch,

    /// OAuth1 callback carried an `oauth_token` that does not match the
    /// pending request token.
    #[error("callback token does not match the pending request token")]
    TokenMismatch,

    /// The token exchange with the provider failed.
    #[error("token exchange failed")]
    ExchangeFailed(#[source] TransportError),

    /// The provider callback hook could not extract account identity from the
    /// raw response.
    #[error("provider callback hook failed: {0}")]
    Hook(String),

    /// The callback is missing a required parameter (e.g. no `code`).
    #[error("callback is missing required parameter '{0}'")]
    MissingParam(&'static str),

    /// Pending-handshake store failure.
    #[error("handshake store error: {0}")]
    Store(String),

    /// No provider is registered under the given short name.
    #[error("provider '{0}' not registered")]
    UnknownProvider(String),

    /// The provider entry lacks the client credentials the flow requires.
    #[error("provider '{0}' is missing client credentials")]
    Misconfigured(String),
}

/// Errors raised by the credential lifecycle manager.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A forced refresh was rejected by the provider; the stored credentials
    /// can no longer be renewed and the owner must reauthorize.
    #[error("token refresh rejected by provider, reauthorization required")]
    RefreshRejected(#[source] TransportError),

    /// The account referenced by the operation does not exist.
    #[error("external account not found")]
    NotAuthorized,

    /// Transport failure during exchange or refresh; the stored credentials
    /// are left untouched.
    #[error("provider transport failure during {operation} for '{provider}'")]
    Transport {
        provider: String,
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    /// Account repository failure.
    #[error("account store error: {0}")]
    Store(String),

    /// Sealing or opening a stored secret failed.
    #[error("secret cipher failure")]
    Cipher(#[from] crate::secrets::CipherError),

    /// No provider is registered under the given short name.
    #[error("provider '{0}' not registered")]
    UnknownProvider(String),
}

/// Errors raised by the authorization grant ledger.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// The owner attempted to grant access to an account they do not hold.
    #[error("account is not owned by the granting owner")]
    NotOwned,

    /// The operation requires a binding backed by a live grant, and there
    /// is none.
    #[error("no grant backs this binding")]
    GrantMissing,
}
