//! Full-path exercise: handshake, account upsert, granting, scoping,
//! forking, merging, and disconnection against an in-memory stack with a
//! stubbed provider client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use url::Url;
use uuid::Uuid;

use oauth_broker::bindings::BindingService;
use oauth_broker::config::AppConfig;
use oauth_broker::error::TransportError;
use oauth_broker::handshake::{CallbackParams, HandshakeEngine};
use oauth_broker::ledger::{GrantLedger, GrantMetadata, MetadataValue};
use oauth_broker::lifecycle::CredentialLifecycleManager;
use oauth_broker::models::binding::{BindingStatus, ScopeSelection};
use oauth_broker::providers::client::{
    ExchangeParams, ProviderClient, RawTokenResponse, RequestTokenPair,
};
use oauth_broker::providers::registry::ProviderRegistry;
use oauth_broker::providers::{box_callback_hook, OAuthVersion, ProviderConfig};
use oauth_broker::secrets::PassthroughCipher;
use oauth_broker::stores::accounts::{AccountRepository, InMemoryAccountRepository};
use oauth_broker::stores::handshake::InMemoryHandshakeStore;

struct ScriptedClient {
    revokes: AtomicUsize,
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn begin_oauth1(&self) -> Result<RequestTokenPair, TransportError> {
        Err(TransportError::Network("oauth1 unused".to_string()))
    }

    async fn exchange(&self, params: ExchangeParams) -> Result<RawTokenResponse, TransportError> {
        match params {
            ExchangeParams::AuthorizationCode { code, .. } if code == "good-code" => {
                Ok(RawTokenResponse {
                    access_token: Some("T".to_string()),
                    refresh_token: Some("R".to_string()),
                    expires_in: Some(3600),
                    scope: Some("root_readwrite".to_string()),
                    extra: json!({"user": {"id": "box-user-7", "name": "Pat"}}),
                    ..Default::default()
                })
            }
            _ => Err(TransportError::Rejected {
                code: "invalid_grant".to_string(),
                detail: "unknown code".to_string(),
            }),
        }
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RawTokenResponse, TransportError> {
        Ok(RawTokenResponse {
            access_token: Some("T-next".to_string()),
            expires_in: Some(3600),
            ..Default::default()
        })
    }

    async fn revoke(&self, _token: &str) -> Result<(), TransportError> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Stack {
    engine: HandshakeEngine,
    lifecycle: Arc<CredentialLifecycleManager>,
    ledger: Arc<GrantLedger>,
    bindings: BindingService,
    repo: Arc<InMemoryAccountRepository>,
    client: Arc<ScriptedClient>,
}

fn stack() -> Stack {
    let config = Arc::new(AppConfig::default());
    let client = Arc::new(ScriptedClient {
        revokes: AtomicUsize::new(0),
    });
    let mut registry = ProviderRegistry::new();
    registry.register(
        ProviderConfig {
            short_name: "box".to_string(),
            display_name: "Box".to_string(),
            oauth_version: OAuthVersion::V2,
            auth_url_base: Url::parse("https://account.box.com/api/oauth2/authorize").unwrap(),
            client_id: Some("cid".to_string()),
            client_secret: Some("sec".to_string()),
            default_scopes: vec!["root_readwrite".to_string()],
            send_redirect_uri: true,
            redirect_uri: Some(Url::parse("https://broker.example/callback/box").unwrap()),
            refresh_window_seconds: 1800,
            expiry_window_seconds: 60 * 24 * 60 * 60,
        },
        box_callback_hook(),
        client.clone(),
    );
    let registry = Arc::new(registry);
    let repo = Arc::new(InMemoryAccountRepository::new());
    let engine = HandshakeEngine::new(
        config.clone(),
        registry.clone(),
        Arc::new(InMemoryHandshakeStore::new()),
    );
    let lifecycle = Arc::new(CredentialLifecycleManager::new(
        config,
        registry,
        repo.clone(),
        Arc::new(PassthroughCipher),
    ));
    let ledger = Arc::new(GrantLedger::new());
    let bindings = BindingService::new(ledger.clone(), lifecycle.clone(), repo.clone());
    Stack {
        engine,
        lifecycle,
        ledger,
        bindings,
        repo,
        client,
    }
}

fn echoed_state(url: &Url) -> String {
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .expect("authorization URL carries a state parameter")
}

#[tokio::test]
async fn handshake_to_stored_account() -> anyhow::Result<()> {
    let stack = stack();
    let actor = Uuid::new_v4();

    let url = stack.engine.begin(actor, "box").await?;
    let (payload, info) = stack
        .engine
        .complete(
            actor,
            "box",
            CallbackParams {
                state: Some(echoed_state(&url)),
                code: Some("good-code".to_string()),
                ..Default::default()
            },
        )
        .await?;

    assert_eq!(payload.key, "T");
    assert_eq!(payload.refresh_token.as_deref(), Some("R"));
    let expires_at = payload.expires_at.expect("absolute expiry computed");
    let delta = expires_at - Utc::now();
    assert!(delta > Duration::seconds(3590) && delta <= Duration::seconds(3600));

    let account = stack
        .lifecycle
        .upsert_account("box", &payload, &info)
        .await?;
    assert_eq!(account.provider_account_id, "box-user-7");
    assert_eq!(account.access_token.sealed(), "T");
    assert_eq!(account.scopes, vec!["root_readwrite".to_string()]);
    assert_eq!(account.display_name.as_deref(), Some("Pat"));
    assert!(account.last_refreshed_at.is_some());

    // The pending state was consumed; replaying the callback fails.
    let replay = stack
        .engine
        .complete(
            actor,
            "box",
            CallbackParams {
                state: Some(echoed_state(&url)),
                code: Some("good-code".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(replay.is_err());
    Ok(())
}

#[tokio::test]
async fn reauthorizing_the_same_remote_identity_reuses_the_account() {
    let stack = stack();
    let first_actor = Uuid::new_v4();
    let second_actor = Uuid::new_v4();
    let mut ids = Vec::new();

    for actor in [first_actor, second_actor] {
        let url = stack.engine.begin(actor, "box").await.unwrap();
        let (payload, info) = stack
            .engine
            .complete(
                actor,
                "box",
                CallbackParams {
                    state: Some(echoed_state(&url)),
                    code: Some("good-code".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let account = stack
            .lifecycle
            .upsert_account("box", &payload, &info)
            .await
            .unwrap();
        ids.push(account.id);
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(stack.repo.len().await, 1);
}

#[tokio::test]
async fn grant_scope_fork_merge_disconnect() {
    let stack = stack();
    let actor = Uuid::new_v4();
    let colleague = Uuid::new_v4();
    let project = Uuid::new_v4();
    let forked_project = Uuid::new_v4();

    let url = stack.engine.begin(actor, "box").await.unwrap();
    let (payload, info) = stack
        .engine
        .complete(
            actor,
            "box",
            CallbackParams {
                state: Some(echoed_state(&url)),
                code: Some("good-code".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let account = stack
        .lifecycle
        .upsert_account("box", &payload, &info)
        .await
        .unwrap();

    stack.ledger.link_account(actor, account.id).await;
    stack
        .bindings
        .set_auth(project, "box", actor, account.id, GrantMetadata::new())
        .await
        .unwrap();
    stack
        .bindings
        .set_scope(project, actor, ScopeSelection::new("5").with_name("Shared"))
        .await
        .unwrap();
    assert_eq!(stack.bindings.status(project).await, BindingStatus::Scoped);

    // The mirrored scope is visible to fine-grained verification.
    let mut required = GrantMetadata::new();
    required.insert("folder".to_string(), MetadataValue::Str("5".to_string()));
    assert!(stack.ledger.verify(actor, project, account.id, Some(&required)).await);

    // The authorizing owner's fork inherits access and scope.
    let fork_status = stack
        .bindings
        .fork(project, forked_project, actor)
        .await
        .unwrap();
    assert_eq!(fork_status, BindingStatus::Scoped);

    // Identity consolidation: everything moves to the colleague.
    stack.bindings.merge_owners(actor, colleague).await;
    assert!(stack.ledger.verify(colleague, project, account.id, None).await);
    assert!(!stack.ledger.verify(actor, project, account.id, None).await);
    assert_eq!(stack.bindings.status(project).await, BindingStatus::Scoped);

    // Disconnect clears both bindings and, as the last owner reference,
    // triggers the remote revoke.
    let outcome = stack.bindings.disconnect_account(colleague, account.id).await;
    assert_eq!(outcome.resources.len(), 2);
    assert!(outcome.last_owner_reference);
    assert_eq!(stack.bindings.status(project).await, BindingStatus::Unconfigured);
    assert_eq!(
        stack.bindings.status(forked_project).await,
        BindingStatus::Unconfigured
    );
    assert_eq!(stack.client.revokes.load(Ordering::SeqCst), 1);

    // The credential record outlives the grants.
    assert!(stack.repo.find(account.id).await.unwrap().is_some());
}
