//! # OAuth Handshake Engine
//!
//! Drives the OAuth1/OAuth2 dance per `(actor, provider)` pair: builds the
//! authorization URL, validates the callback against the pending state,
//! exchanges the authorization artifact for tokens, and normalizes the result
//! into a token payload plus provider-extracted account identity.
//!
//! State machine per pair: `NONE → PENDING → (AUTHORIZED | FAILED)`.
//! Re-beginning while pending overwrites the prior state (last-writer-wins);
//! that is what a browser back-button retry looks like. A mismatched or
//! timed-out callback leaves the pending state intact so the genuine callback
//! can still land; success and definitive provider rejection consume it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{HandshakeError, TransportError};
use crate::models::handshake_state::{HandshakeKey, HandshakeState, PendingCredentials};
use crate::models::OwnerId;
use crate::providers::client::{ExchangeParams, RawTokenResponse};
use crate::providers::registry::{ProviderEntry, ProviderRegistry};
use crate::providers::{AccountInfo, OAuthVersion};
use crate::stores::handshake::PendingHandshakeStore;

/// Query parameters delivered to the callback endpoint by the provider.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
    /// Set when the user denied the grant or the provider aborted the flow.
    pub error: Option<String>,
}

/// Token material normalized out of a provider's exchange response. Absent
/// raw fields stay absent here — an omitted value must never overwrite a
/// previously known one downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTokenPayload {
    /// OAuth1 `oauth_token` / OAuth2 `access_token`.
    pub key: String,
    /// OAuth1 `oauth_token_secret`.
    pub secret: Option<String>,
    /// OAuth2 refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<Vec<String>>,
}

pub struct HandshakeEngine {
    config: Arc<AppConfig>,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn PendingHandshakeStore>,
}

impl HandshakeEngine {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn PendingHandshakeStore>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Begin the dance: record pending state and return the URL to send the
    /// actor to.
    pub async fn begin(&self, actor: OwnerId, provider: &str) -> Result<Url, HandshakeError> {
        let entry = self.entry(provider)?;
        let key = HandshakeKey::new(actor, provider);

        let url = match entry.config.oauth_version {
            OAuthVersion::V2 => {
                let client_id = entry
                    .config
                    .client_id
                    .as_deref()
                    .ok_or_else(|| HandshakeError::Misconfigured(provider.to_string()))?;
                let state = generate_state();

                let mut url = entry.config.auth_url_base.clone();
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs
                        .append_pair("response_type", "code")
                        .append_pair("client_id", client_id)
                        .append_pair("state", &state);
                    if !entry.config.default_scopes.is_empty() {
                        pairs.append_pair("scope", &entry.config.default_scopes.join(" "));
                    }
                    if entry.config.send_redirect_uri {
                        if let Some(redirect) = entry.config.redirect_uri.as_ref() {
                            pairs.append_pair("redirect_uri", redirect.as_str());
                        }
                    }
                }

                self.store
                    .put(key, HandshakeState::oauth2(state), self.config.handshake_ttl())
                    .await
                    .map_err(|e| HandshakeError::Store(e.to_string()))?;
                url
            }
            OAuthVersion::V1 => {
                let pair = self
                    .with_deadline(entry.client.begin_oauth1())
                    .await
                    .map_err(HandshakeError::ExchangeFailed)?;

                let mut url = entry.config.auth_url_base.clone();
                url.query_pairs_mut()
                    .append_pair("oauth_token", &pair.request_token);

                self.store
                    .put(
                        key,
                        HandshakeState::oauth1(pair.request_token, pair.request_token_secret),
                        self.config.handshake_ttl(),
                    )
                    .await
                    .map_err(|e| HandshakeError::Store(e.to_string()))?;
                url
            }
        };

        counter!("handshake_begin_total").increment(1);
        info!(actor = %actor, provider, "handshake started");
        Ok(url)
    }

    /// Validate the callback, exchange for tokens, and normalize the result.
    pub async fn complete(
        &self,
        actor: OwnerId,
        provider: &str,
        params: CallbackParams,
    ) -> Result<(NormalizedTokenPayload, AccountInfo), HandshakeError> {
        let entry = self.entry(provider)?;
        let key = HandshakeKey::new(actor, provider);

        let pending = self
            .store
            .get(&key)
            .await
            .map_err(|e| HandshakeError::Store(e.to_string()))?
            .ok_or(HandshakeError::NotFound)?;

        // A provider-reported denial is definitive: consume the pending state.
        if let Some(error) = params.error {
            self.consume(&key).await;
            counter!("handshake_denied_total").increment(1);
            return Err(HandshakeError::ExchangeFailed(TransportError::Rejected {
                code: error,
                detail: "provider reported an authorization error".to_string(),
            }));
        }

        let exchange = match (&pending.credentials, entry.config.oauth_version) {
            (PendingCredentials::OAuth2 { state }, OAuthVersion::V2) => {
                let echoed = params
                    .state
                    .as_deref()
                    .ok_or(HandshakeError::MissingParam("state"))?;
                if echoed != state.as_str() {
                    warn!(actor = %actor, provider, "handshake state mismatch");
                    return Err(HandshakeError::StateMismatch);
                }
                let code = params.code.ok_or(HandshakeError::MissingParam("code"))?;
                ExchangeParams::AuthorizationCode {
                    code,
                    redirect_uri: if entry.config.send_redirect_uri {
                        entry.config.redirect_uri.clone()
                    } else {
                        None
                    },
                }
            }
            (
                PendingCredentials::OAuth1 {
                    request_token,
                    request_token_secret,
                },
                OAuthVersion::V1,
            ) => {
                let echoed = params
                    .oauth_token
                    .as_deref()
                    .ok_or(HandshakeError::MissingParam("oauth_token"))?;
                if echoed != request_token.as_str() {
                    warn!(actor = %actor, provider, "handshake request token mismatch");
                    return Err(HandshakeError::TokenMismatch);
                }
                let verifier = params
                    .oauth_verifier
                    .ok_or(HandshakeError::MissingParam("oauth_verifier"))?;
                ExchangeParams::RequestToken {
                    request_token: request_token.clone(),
                    request_token_secret: request_token_secret.clone(),
                    verifier,
                }
            }
            // Pending state written under a different protocol version than
            // the registry now claims; force a fresh begin.
            _ => {
                self.consume(&key).await;
                return Err(HandshakeError::NotFound);
            }
        };

        let response = match self.with_deadline(entry.client.exchange(exchange)).await {
            Ok(response) => response,
            Err(err) => {
                // Definitive rejection consumes the state; a timeout or
                // network fault leaves it for the actor to retry.
                if matches!(err, TransportError::Rejected { .. }) {
                    self.consume(&key).await;
                }
                counter!("handshake_exchange_failed_total").increment(1);
                return Err(HandshakeError::ExchangeFailed(err));
            }
        };

        self.consume(&key).await;

        let payload = normalize(entry.config.oauth_version, &response)?;
        let info = (entry.hook)(&response)?;

        counter!("handshake_completed_total").increment(1);
        info!(
            actor = %actor,
            provider,
            provider_account_id = %info.provider_account_id,
            "handshake completed"
        );
        Ok((payload, info))
    }

    fn entry(&self, provider: &str) -> Result<Arc<ProviderEntry>, HandshakeError> {
        self.registry
            .get(provider)
            .map_err(|_| HandshakeError::UnknownProvider(provider.to_string()))
    }

    async fn consume(&self, key: &HandshakeKey) {
        if let Err(err) = self.store.delete(key).await {
            warn!(error = %err, "failed to delete pending handshake state");
        }
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.config.provider_call_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Generate a CSRF state token: 32 random bytes, URL-safe base64.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64_url::encode(&bytes)
}

/// Map the raw exchange response onto the normalized payload. Absent fields
/// stay absent; a response with no usable token is a failed exchange.
pub fn normalize(
    version: OAuthVersion,
    response: &RawTokenResponse,
) -> Result<NormalizedTokenPayload, HandshakeError> {
    let payload = match version {
        OAuthVersion::V1 => NormalizedTokenPayload {
            key: response
                .oauth_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or(HandshakeError::ExchangeFailed(TransportError::Rejected {
                    code: "missing_token".to_string(),
                    detail: "exchange response carried no oauth_token".to_string(),
                }))?,
            secret: response.oauth_token_secret.clone().filter(|s| !s.is_empty()),
            refresh_token: None,
            expires_at: None,
            scopes: None,
        },
        OAuthVersion::V2 => NormalizedTokenPayload {
            key: response
                .access_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or(HandshakeError::ExchangeFailed(TransportError::Rejected {
                    code: "missing_token".to_string(),
                    detail: "exchange response carried no access_token".to_string(),
                }))?,
            secret: None,
            refresh_token: response.refresh_token.clone().filter(|t| !t.is_empty()),
            expires_at: response
                .expires_at
                .or_else(|| crate::providers::default_expiry(response)),
            scopes: response.scopes(),
        },
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::client::{ProviderClient, RequestTokenPair};
    use crate::providers::{box_callback_hook, ProviderConfig};
    use crate::stores::handshake::InMemoryHandshakeStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct StubClient {
        exchanges: AtomicUsize,
        response: RawTokenResponse,
        fail_with: Option<TransportError>,
    }

    impl StubClient {
        fn succeeding() -> Self {
            Self {
                exchanges: AtomicUsize::new(0),
                response: RawTokenResponse {
                    access_token: Some("T".to_string()),
                    refresh_token: Some("R".to_string()),
                    expires_in: Some(3600),
                    scope: Some("root_readwrite".to_string()),
                    extra: json!({"user": {"id": "u-9", "name": "Pat"}}),
                    ..Default::default()
                },
                fail_with: None,
            }
        }

        fn failing(err: TransportError) -> Self {
            Self {
                exchanges: AtomicUsize::new(0),
                response: RawTokenResponse::default(),
                fail_with: Some(err),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for StubClient {
        async fn begin_oauth1(&self) -> Result<RequestTokenPair, TransportError> {
            Ok(RequestTokenPair {
                request_token: "req-tok".to_string(),
                request_token_secret: "req-sec".to_string(),
            })
        }

        async fn exchange(
            &self,
            _params: ExchangeParams,
        ) -> Result<RawTokenResponse, TransportError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(self.response.clone()),
            }
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RawTokenResponse, TransportError> {
            Ok(self.response.clone())
        }

        async fn revoke(&self, _token: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn oauth2_config(send_redirect_uri: bool) -> ProviderConfig {
        ProviderConfig {
            short_name: "box".to_string(),
            display_name: "Box".to_string(),
            oauth_version: OAuthVersion::V2,
            auth_url_base: Url::parse("https://account.box.com/api/oauth2/authorize").unwrap(),
            client_id: Some("cid".to_string()),
            client_secret: Some("sec".to_string()),
            default_scopes: vec!["root_readwrite".to_string()],
            send_redirect_uri,
            redirect_uri: Some(Url::parse("https://host.example/oauth/callback/box").unwrap()),
            refresh_window_seconds: 1800,
            expiry_window_seconds: 0,
        }
    }

    fn engine_with(client: Arc<StubClient>, config: ProviderConfig) -> HandshakeEngine {
        let mut registry = ProviderRegistry::new();
        registry.register(config, box_callback_hook(), client);
        HandshakeEngine::new(
            Arc::new(AppConfig::default()),
            Arc::new(registry),
            Arc::new(InMemoryHandshakeStore::new()),
        )
    }

    fn state_param(url: &Url) -> String {
        url.query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .expect("state parameter present")
    }

    #[tokio::test]
    async fn begin_builds_authorization_url_with_state() {
        let engine = engine_with(Arc::new(StubClient::succeeding()), oauth2_config(true));
        let url = engine.begin(Uuid::new_v4(), "box").await.unwrap();

        assert!(url.as_str().starts_with("https://account.box.com/"));
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(pairs.iter().any(|(k, v)| k == "client_id" && v == "cid"));
        assert!(pairs.iter().any(|(k, v)| k == "scope" && v == "root_readwrite"));
        assert!(pairs.iter().any(|(k, _)| k == "state"));
        assert!(pairs.iter().any(|(k, _)| k == "redirect_uri"));
        assert_eq!(state_param(&url).len(), 43);
    }

    #[tokio::test]
    async fn redirect_uri_omission_flag_is_honored() {
        let engine = engine_with(Arc::new(StubClient::succeeding()), oauth2_config(false));
        let url = engine.begin(Uuid::new_v4(), "box").await.unwrap();
        assert!(!url.query_pairs().any(|(k, _)| k == "redirect_uri"));
    }

    #[tokio::test]
    async fn complete_without_begin_is_not_recognized() {
        let engine = engine_with(Arc::new(StubClient::succeeding()), oauth2_config(true));
        let result = engine
            .complete(Uuid::new_v4(), "box", CallbackParams::default())
            .await;
        assert!(matches!(result, Err(HandshakeError::NotFound)));
    }

    #[tokio::test]
    async fn state_mismatch_fails_and_preserves_pending_state() {
        let client = Arc::new(StubClient::succeeding());
        let engine = engine_with(client.clone(), oauth2_config(true));
        let actor = Uuid::new_v4();
        let url = engine.begin(actor, "box").await.unwrap();

        let result = engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    state: Some("forged".to_string()),
                    code: Some("abc".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(HandshakeError::StateMismatch)));
        assert_eq!(client.exchanges.load(Ordering::SeqCst), 0);

        // The genuine callback still succeeds afterwards.
        let (payload, info) = engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    state: Some(state_param(&url)),
                    code: Some("abc".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(payload.key, "T");
        assert_eq!(info.provider_account_id, "u-9");
    }

    #[tokio::test]
    async fn success_consumes_the_pending_state() {
        let engine = engine_with(Arc::new(StubClient::succeeding()), oauth2_config(true));
        let actor = Uuid::new_v4();
        let url = engine.begin(actor, "box").await.unwrap();
        let params = CallbackParams {
            state: Some(state_param(&url)),
            code: Some("abc".to_string()),
            ..Default::default()
        };

        engine.complete(actor, "box", params.clone()).await.unwrap();
        let replay = engine.complete(actor, "box", params).await;
        assert!(matches!(replay, Err(HandshakeError::NotFound)));
    }

    #[tokio::test]
    async fn rebegin_overwrites_and_invalidates_the_old_state() {
        let engine = engine_with(Arc::new(StubClient::succeeding()), oauth2_config(true));
        let actor = Uuid::new_v4();
        let first = engine.begin(actor, "box").await.unwrap();
        let second = engine.begin(actor, "box").await.unwrap();
        assert_ne!(state_param(&first), state_param(&second));

        let stale = engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    state: Some(state_param(&first)),
                    code: Some("abc".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(stale, Err(HandshakeError::StateMismatch)));
    }

    #[tokio::test]
    async fn provider_rejection_consumes_state() {
        let engine = engine_with(
            Arc::new(StubClient::failing(TransportError::Rejected {
                code: "invalid_grant".to_string(),
                detail: "code expired".to_string(),
            })),
            oauth2_config(true),
        );
        let actor = Uuid::new_v4();
        let url = engine.begin(actor, "box").await.unwrap();
        let params = CallbackParams {
            state: Some(state_param(&url)),
            code: Some("abc".to_string()),
            ..Default::default()
        };

        let result = engine.complete(actor, "box", params.clone()).await;
        assert!(matches!(result, Err(HandshakeError::ExchangeFailed(_))));

        let retry = engine.complete(actor, "box", params).await;
        assert!(matches!(retry, Err(HandshakeError::NotFound)));
    }

    #[tokio::test]
    async fn network_failure_preserves_state_for_retry() {
        let engine = engine_with(
            Arc::new(StubClient::failing(TransportError::Network(
                "connection reset".to_string(),
            ))),
            oauth2_config(true),
        );
        let actor = Uuid::new_v4();
        let url = engine.begin(actor, "box").await.unwrap();
        let params = CallbackParams {
            state: Some(state_param(&url)),
            code: Some("abc".to_string()),
            ..Default::default()
        };

        let result = engine.complete(actor, "box", params.clone()).await;
        assert!(matches!(
            result,
            Err(HandshakeError::ExchangeFailed(TransportError::Network(_)))
        ));

        // Still pending: the retry reaches the exchange again rather than
        // failing with NotFound.
        let retry = engine.complete(actor, "box", params).await;
        assert!(matches!(retry, Err(HandshakeError::ExchangeFailed(_))));
    }

    #[tokio::test]
    async fn oauth1_round_trip_normalizes_token_pair() {
        let mut config = oauth2_config(true);
        config.oauth_version = OAuthVersion::V1;
        let client = Arc::new(StubClient {
            exchanges: AtomicUsize::new(0),
            response: RawTokenResponse {
                oauth_token: Some("final-tok".to_string()),
                oauth_token_secret: Some("final-sec".to_string()),
                extra: json!({"user": {"id": "u-1"}}),
                ..Default::default()
            },
            fail_with: None,
        });
        let engine = engine_with(client, config);
        let actor = Uuid::new_v4();

        let url = engine.begin(actor, "box").await.unwrap();
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "oauth_token" && v == "req-tok"));

        let (payload, _) = engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    oauth_token: Some("req-tok".to_string()),
                    oauth_verifier: Some("v".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(payload.key, "final-tok");
        assert_eq!(payload.secret.as_deref(), Some("final-sec"));
        assert!(payload.refresh_token.is_none());
    }

    #[tokio::test]
    async fn oauth1_token_mismatch_is_rejected() {
        let mut config = oauth2_config(true);
        config.oauth_version = OAuthVersion::V1;
        let engine = engine_with(Arc::new(StubClient::succeeding()), config);
        let actor = Uuid::new_v4();
        engine.begin(actor, "box").await.unwrap();

        let result = engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    oauth_token: Some("someone-elses".to_string()),
                    oauth_verifier: Some("v".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(HandshakeError::TokenMismatch)));
    }

    #[test]
    fn normalization_distinguishes_absent_from_empty() {
        let response = RawTokenResponse {
            access_token: Some("T".to_string()),
            refresh_token: Some(String::new()),
            ..Default::default()
        };
        let payload = normalize(OAuthVersion::V2, &response).unwrap();
        assert_eq!(payload.key, "T");
        assert!(payload.refresh_token.is_none());
        assert!(payload.expires_at.is_none());
        assert!(payload.scopes.is_none());
    }

    #[test]
    fn normalization_requires_a_token() {
        let result = normalize(OAuthVersion::V2, &RawTokenResponse::default());
        assert!(matches!(result, Err(HandshakeError::ExchangeFailed(_))));
    }

    #[test]
    fn generated_states_are_unique_and_url_safe() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
