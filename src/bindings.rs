//! # Binding service
//!
//! Orchestrates the resource side: which account a resource is wired to and
//! what scope it selected. The grant ledger stays the source of truth; a
//! binding is written only after the corresponding grant, and its status is
//! always computed against a live grant check so an owner-side revocation
//! demotes the binding the moment anyone looks.
//!
//! Binding state machine: `UNCONFIGURED → AUTHORIZED → SCOPED`, with
//! deauthorize reachable from any state (clears account and scope, leaves the
//! grant) and full revocation only through [`BindingService::disconnect_account`]
//! (clears account, scope, and the grant in one pass).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::AuthzError;
use crate::ledger::{GrantLedger, GrantMetadata, MetadataValue, RevokeOutcome};
use crate::lifecycle::CredentialLifecycleManager;
use crate::models::binding::{BindingStatus, ProviderBinding, ScopeSelection};
use crate::models::{AccountId, OwnerId, ResourceId};
use crate::stores::accounts::AccountRepository;

/// Metadata key under which a binding's scope selection is mirrored into the
/// grant, so fine-grained `verify` calls can require the specific selection.
pub const SCOPE_METADATA_KEY: &str = "folder";

pub struct BindingService {
    ledger: Arc<GrantLedger>,
    lifecycle: Arc<CredentialLifecycleManager>,
    accounts: Arc<dyn AccountRepository>,
    bindings: Mutex<HashMap<ResourceId, ProviderBinding>>,
}

impl BindingService {
    pub fn new(
        ledger: Arc<GrantLedger>,
        lifecycle: Arc<CredentialLifecycleManager>,
        accounts: Arc<dyn AccountRepository>,
    ) -> Self {
        Self {
            ledger,
            lifecycle,
            accounts,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Wire `resource` to `account` under `owner`'s authority. The ledger
    /// grant is written first; the binding exists only once the grant does.
    /// Switching to a different account drops any stale scope selection.
    pub async fn set_auth(
        &self,
        resource: ResourceId,
        provider: &str,
        owner: OwnerId,
        account: AccountId,
        metadata: GrantMetadata,
    ) -> Result<(), AuthzError> {
        self.ledger.grant(owner, resource, account, metadata).await?;

        let mut bindings = self.bindings.lock().await;
        let binding = bindings
            .entry(resource)
            .or_insert_with(|| ProviderBinding::unconfigured(resource, provider));
        if binding.account_id != Some(account) {
            binding.scope = None;
        }
        binding.account_id = Some(account);
        binding.authorized_by = Some(owner);
        info!(resource = %resource, owner = %owner, account = %account, "binding authorized");
        Ok(())
    }

    /// Record the resource-specific selection and mirror it into the grant
    /// metadata. Requires a binding backed by a live grant held by `owner`.
    pub async fn set_scope(
        &self,
        resource: ResourceId,
        owner: OwnerId,
        selection: ScopeSelection,
    ) -> Result<(), AuthzError> {
        let account = {
            let bindings = self.bindings.lock().await;
            bindings
                .get(&resource)
                .filter(|b| b.authorized_by == Some(owner))
                .and_then(|b| b.account_id)
                .ok_or(AuthzError::GrantMissing)?
        };
        if !self.ledger.verify(owner, resource, account, None).await {
            return Err(AuthzError::GrantMissing);
        }

        let mut mirror = GrantMetadata::new();
        mirror.insert(
            SCOPE_METADATA_KEY.to_string(),
            MetadataValue::Str(selection.id.clone()),
        );
        self.ledger.grant(owner, resource, account, mirror).await?;

        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings.get_mut(&resource) {
            binding.scope = Some(selection);
        }
        info!(resource = %resource, owner = %owner, "binding scoped");
        Ok(())
    }

    /// Clear the binding's account and scope. The grant in the ledger is
    /// untouched; the owner can re-authorize without a new handshake.
    pub async fn deauthorize(&self, resource: ResourceId) {
        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings.get_mut(&resource) {
            binding.clear_auth();
            info!(resource = %resource, "binding deauthorized");
        }
    }

    /// Revoke every grant the owner holds for `account`, clear the bindings
    /// of each affected resource in the same pass, and, when no other owner
    /// still links the account, ask the provider to drop the grant remotely.
    pub async fn disconnect_account(
        &self,
        owner: OwnerId,
        account: AccountId,
    ) -> RevokeOutcome {
        let outcome = self.ledger.revoke(owner, account).await;

        {
            let mut bindings = self.bindings.lock().await;
            for resource in &outcome.resources {
                if let Some(binding) = bindings.get_mut(resource) {
                    binding.clear_auth();
                }
            }
        }

        if outcome.last_owner_reference {
            match self.accounts.find(account).await {
                Ok(Some(record)) => self.lifecycle.revoke_remote(&record).await,
                Ok(None) => {}
                Err(err) => {
                    warn!(account = %account, error = %err, "remote revoke skipped");
                }
            }
        }
        outcome
    }

    /// Copy `resource`'s binding onto `new_resource` for a fork. Working
    /// access carries over only when the forking actor is the owner who
    /// authorized the original; anyone else's fork starts unconfigured.
    pub async fn fork(
        &self,
        resource: ResourceId,
        new_resource: ResourceId,
        forking_owner: OwnerId,
    ) -> Result<BindingStatus, AuthzError> {
        let original = {
            let bindings = self.bindings.lock().await;
            bindings.get(&resource).cloned()
        };
        let Some(original) = original else {
            return Ok(BindingStatus::Unconfigured);
        };

        let inherited = match (original.authorized_by, original.account_id) {
            (Some(owner), Some(account)) => self
                .ledger
                .fork(owner, resource, account, forking_owner)
                .await
                .map(|metadata| (owner, account, metadata)),
            _ => None,
        };

        let forked = match inherited {
            Some((owner, account, metadata)) => {
                self.ledger
                    .grant(owner, new_resource, account, metadata)
                    .await?;
                ProviderBinding {
                    resource_id: new_resource,
                    provider: original.provider.clone(),
                    account_id: Some(account),
                    authorized_by: Some(owner),
                    scope: original.scope.clone(),
                }
            }
            None => ProviderBinding::unconfigured(new_resource, original.provider.clone()),
        };
        let status = match (&forked.account_id, &forked.scope) {
            (Some(_), Some(_)) => BindingStatus::Scoped,
            (Some(_), None) => BindingStatus::Authorized,
            _ => BindingStatus::Unconfigured,
        };

        let mut bindings = self.bindings.lock().await;
        bindings.insert(new_resource, forked);
        info!(resource = %resource, fork = %new_resource, ?status, "binding forked");
        Ok(status)
    }

    /// Fold `source`'s ledger into `dest` and repoint surviving bindings that
    /// `source` had authorized.
    pub async fn merge_owners(&self, source: OwnerId, dest: OwnerId) {
        self.ledger.merge(source, dest).await;

        let mut bindings = self.bindings.lock().await;
        for binding in bindings.values_mut() {
            if binding.authorized_by == Some(source) {
                binding.authorized_by = Some(dest);
            }
        }
        info!(source = %source, dest = %dest, "owners merged");
    }

    /// Connection state, computed against a live grant check.
    pub async fn status(&self, resource: ResourceId) -> BindingStatus {
        let binding = {
            let bindings = self.bindings.lock().await;
            bindings.get(&resource).cloned()
        };
        let Some(binding) = binding else {
            return BindingStatus::Unconfigured;
        };
        let (Some(owner), Some(account)) = (binding.authorized_by, binding.account_id) else {
            return BindingStatus::Unconfigured;
        };
        if !self.ledger.verify(owner, resource, account, None).await {
            return BindingStatus::Unconfigured;
        }
        if binding.scope.is_some() {
            BindingStatus::Scoped
        } else {
            BindingStatus::Authorized
        }
    }

    /// The stored binding record, if any.
    pub async fn binding(&self, resource: ResourceId) -> Option<ProviderBinding> {
        let bindings = self.bindings.lock().await;
        bindings.get(&resource).cloned()
    }
}
