//! # Credential lifecycle manager
//!
//! Owns everything that happens to an [`ExternalAccount`] after the handshake:
//! upserting the record from a normalized token payload, deciding when tokens
//! are due for renewal, performing the renewal itself, and asking the provider
//! to drop its side of a grant on disconnect.
//!
//! Refreshes are single-flight per account: concurrent callers racing on the
//! same account collapse to at most one outbound provider call, with the
//! losers re-reading the stored record after the winner saves it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{CredentialError, TransportError};
use crate::handshake::NormalizedTokenPayload;
use crate::models::external_account::ExternalAccount;
use crate::models::AccountId;
use crate::providers::registry::{ProviderEntry, ProviderRegistry};
use crate::providers::AccountInfo;
use crate::secrets::{CipherHandle, SecretField};
use crate::stores::accounts::AccountRepository;

/// Why a refresh did not happen. None of these are errors; they describe a
/// credential that does not need or cannot take a renewal right now.
#[derive(Debug, Clone)]
pub enum SkipReason {
    /// The account has no refresh token, or the provider's refresh window is
    /// zero (its tokens never time-trigger renewal).
    NotRefreshCapable,
    /// The provider entry is missing client credentials.
    MissingClientCredentials,
    /// The token is not inside the refresh window yet.
    NotDue,
    /// The token sat expired past the expiry window; only a forced refresh
    /// will attempt renewal.
    Expired,
    /// The provider rejected the refresh and the caller did not force it.
    ProviderRejected(TransportError),
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(ExternalAccount),
    NotRefreshed(SkipReason),
}

/// True when the token expires within `window_seconds` from now. A zero
/// window means the provider's tokens never time-trigger a refresh.
pub fn needs_refresh(account: &ExternalAccount, window_seconds: u64) -> bool {
    if window_seconds == 0 {
        return false;
    }
    match account.expires_at {
        Some(expires_at) => (expires_at - Utc::now()).num_seconds() < window_seconds as i64,
        None => false,
    }
}

/// True when the token has sat expired for longer than `window_seconds`,
/// past the point where an unforced refresh is worth attempting. A zero
/// window means credentials never reach this state.
pub fn has_expired(account: &ExternalAccount, window_seconds: u64) -> bool {
    if window_seconds == 0 {
        return false;
    }
    match account.expires_at {
        Some(expires_at) => (Utc::now() - expires_at).num_seconds() > window_seconds as i64,
        None => false,
    }
}

pub struct CredentialLifecycleManager {
    config: Arc<AppConfig>,
    registry: Arc<ProviderRegistry>,
    repo: Arc<dyn AccountRepository>,
    cipher: CipherHandle,
    in_flight: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl CredentialLifecycleManager {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ProviderRegistry>,
        repo: Arc<dyn AccountRepository>,
        cipher: CipherHandle,
    ) -> Self {
        Self {
            config,
            registry,
            repo,
            cipher,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Find-or-create the account for `(provider, info.provider_account_id)`
    /// and fold the normalized payload into it. The access token is always
    /// overwritten; optional fields overwrite only when present, so a response
    /// that omits a refresh token never clobbers the one already stored.
    pub async fn upsert_account(
        &self,
        provider: &str,
        payload: &NormalizedTokenPayload,
        info: &AccountInfo,
    ) -> Result<ExternalAccount, CredentialError> {
        let entry = self.entry(provider)?;

        // Two callers racing on the same remote identity can both miss the
        // lookup; the loser's save is rejected by the uniqueness invariant,
        // so it re-reads and folds into the winner's record.
        let mut attempt = 0;
        loop {
            let mut account = match self
                .repo
                .find_by_remote_id(provider, &info.provider_account_id)
                .await
                .map_err(|e| CredentialError::Store(e.to_string()))?
            {
                Some(existing) => existing,
                None => ExternalAccount {
                    id: Uuid::new_v4(),
                    provider: provider.to_string(),
                    provider_display_name: entry.config.display_name.clone(),
                    provider_account_id: info.provider_account_id.clone(),
                    access_token: SecretField::seal(&self.cipher, &payload.key)?,
                    access_secret: None,
                    refresh_token: None,
                    expires_at: None,
                    last_refreshed_at: None,
                    scopes: Vec::new(),
                    display_name: None,
                    profile_url: None,
                },
            };

            account.access_token = SecretField::seal(&self.cipher, &payload.key)?;
            if let Some(secret) = payload.secret.as_deref() {
                account.access_secret = Some(SecretField::seal(&self.cipher, secret)?);
            }
            if let Some(refresh) = payload.refresh_token.as_deref() {
                account.refresh_token = Some(SecretField::seal(&self.cipher, refresh)?);
            }
            if let Some(expires_at) = payload.expires_at {
                account.expires_at = Some(expires_at);
            }
            if let Some(scopes) = payload.scopes.as_ref() {
                account.scopes = scopes.clone();
            }
            if let Some(name) = info.display_name.as_ref() {
                account.display_name = Some(name.clone());
            }
            if let Some(url) = info.profile_url.as_ref() {
                account.profile_url = Some(url.clone());
            }
            account.last_refreshed_at = Some(Utc::now());

            match self.repo.save(&account).await {
                Ok(()) => {
                    info!(
                        provider,
                        provider_account_id = %account.provider_account_id,
                        account_id = %account.id,
                        "external account upserted"
                    );
                    return Ok(account);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= 2 {
                        return Err(CredentialError::Store(err.to_string()));
                    }
                    debug!(
                        provider,
                        provider_account_id = %info.provider_account_id,
                        error = %err,
                        "upsert lost a concurrent save, refolding"
                    );
                }
            }
        }
    }

    /// Renew the account's access token. `force` bypasses the window checks
    /// and turns a provider rejection into a hard error; unforced callers get
    /// a [`RefreshOutcome::NotRefreshed`] instead.
    pub async fn refresh(
        &self,
        account_id: AccountId,
        force: bool,
    ) -> Result<RefreshOutcome, CredentialError> {
        let account = self.load(account_id).await?;
        let entry = self.entry(&account.provider)?;

        if !account.refresh_capable() {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::NotRefreshCapable));
        }
        // A zero window means tokens never time-trigger renewal; a forced
        // refresh still reaches the provider.
        if !force && entry.config.refresh_window_seconds == 0 {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::NotRefreshCapable));
        }
        if !entry.config.has_client_credentials() {
            return Ok(RefreshOutcome::NotRefreshed(
                SkipReason::MissingClientCredentials,
            ));
        }
        if !force && has_expired(&account, entry.config.expiry_window_seconds) {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::Expired));
        }
        if !force && !needs_refresh(&account, entry.config.refresh_window_seconds) {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::NotDue));
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(account_id).or_default().clone()
        };
        let outcome = {
            let _guard = gate.lock().await;
            self.refresh_gated(account_id, &entry, force).await
        };

        // Drop the gate entry once the last caller through it is done, so
        // the map does not grow with every account ever refreshed.
        {
            let mut in_flight = self.in_flight.lock().await;
            let idle = in_flight
                .get(&account_id)
                .map(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2)
                .unwrap_or(false);
            if idle {
                in_flight.remove(&account_id);
            }
        }
        outcome
    }

    async fn refresh_gated(
        &self,
        account_id: AccountId,
        entry: &ProviderEntry,
        force: bool,
    ) -> Result<RefreshOutcome, CredentialError> {
        // Re-read under the gate: while this caller was queued, a concurrent
        // one may have done the work, or the credentials may have lapsed.
        let account = self.load(account_id).await?;
        if !force && has_expired(&account, entry.config.expiry_window_seconds) {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::Expired));
        }
        if !force && !needs_refresh(&account, entry.config.refresh_window_seconds) {
            return Ok(RefreshOutcome::NotRefreshed(SkipReason::NotDue));
        }

        counter!("credential_refresh_attempts_total").increment(1);
        self.perform_refresh(account, entry, force).await
    }

    async fn load(&self, account_id: AccountId) -> Result<ExternalAccount, CredentialError> {
        self.repo
            .find(account_id)
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))?
            .ok_or(CredentialError::NotAuthorized)
    }

    async fn perform_refresh(
        &self,
        mut account: ExternalAccount,
        entry: &ProviderEntry,
        force: bool,
    ) -> Result<RefreshOutcome, CredentialError> {
        let refresh_token = match account.refresh_token.as_ref() {
            Some(token) => token.open(&self.cipher)?,
            None => return Ok(RefreshOutcome::NotRefreshed(SkipReason::NotRefreshCapable)),
        };

        let response = match self
            .with_deadline(entry.client.refresh(&refresh_token))
            .await
        {
            Ok(response) => response,
            Err(err @ TransportError::Rejected { .. }) => {
                counter!("credential_refresh_failures_total").increment(1);
                warn!(
                    provider = %account.provider,
                    account_id = %account.id,
                    error = %err,
                    "provider rejected token refresh"
                );
                return if force {
                    Err(CredentialError::RefreshRejected(err))
                } else {
                    Ok(RefreshOutcome::NotRefreshed(SkipReason::ProviderRejected(
                        err,
                    )))
                };
            }
            Err(err) => {
                counter!("credential_refresh_failures_total").increment(1);
                return Err(CredentialError::Transport {
                    provider: account.provider.clone(),
                    operation: "refresh",
                    source: err,
                });
            }
        };

        let new_key = response
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CredentialError::RefreshRejected(TransportError::Rejected {
                    code: "missing_token".to_string(),
                    detail: "refresh response carried no access_token".to_string(),
                })
            })?;

        account.access_token = SecretField::seal(&self.cipher, new_key)?;
        if let Some(rotated) = response.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            account.refresh_token = Some(SecretField::seal(&self.cipher, rotated)?);
        }
        if let Some(expires_at) = (entry.expiry_fn)(&response) {
            account.expires_at = Some(expires_at);
        }
        if let Some(scopes) = response.scopes() {
            account.scopes = scopes;
        }
        account.last_refreshed_at = Some(Utc::now());

        self.repo
            .save(&account)
            .await
            .map_err(|e| CredentialError::Store(e.to_string()))?;

        counter!("credential_refresh_success_total").increment(1);
        debug!(
            provider = %account.provider,
            account_id = %account.id,
            "access token refreshed"
        );
        Ok(RefreshOutcome::Refreshed(account))
    }

    /// Ask the provider to drop its side of the grant. Best-effort: the
    /// provider being unreachable must never block a local disconnect, so
    /// every failure is logged and counted rather than propagated.
    pub async fn revoke_remote(&self, account: &ExternalAccount) {
        let entry = match self.entry(&account.provider) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(provider = %account.provider, error = %err, "remote revoke skipped");
                return;
            }
        };
        let token = match account.access_token.open(&self.cipher) {
            Ok(token) => token,
            Err(err) => {
                counter!("remote_revoke_failures_total").increment(1);
                warn!(
                    provider = %account.provider,
                    account_id = %account.id,
                    error = %err,
                    "remote revoke failed to open stored token"
                );
                return;
            }
        };

        match self.with_deadline(entry.client.revoke(&token)).await {
            Ok(()) => {
                debug!(
                    provider = %account.provider,
                    account_id = %account.id,
                    "remote grant revoked"
                );
            }
            Err(err) => {
                counter!("remote_revoke_failures_total").increment(1);
                warn!(
                    provider = %account.provider,
                    account_id = %account.id,
                    error = %err,
                    "remote revoke failed"
                );
            }
        }
    }

    fn entry(&self, provider: &str) -> Result<Arc<ProviderEntry>, CredentialError> {
        self.registry
            .get(provider)
            .map_err(|_| CredentialError::UnknownProvider(provider.to_string()))
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
