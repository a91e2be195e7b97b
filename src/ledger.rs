//! # Authorization grant ledger
//!
//! The owner side of access control: which external accounts an owner has
//! linked, and which resources the owner has granted use of each account,
//! optionally scoped by provider-specific metadata such as a folder id.
//!
//! Each owner's ledger is guarded by its own async mutex. Grant, revoke, and
//! merge are read-modify-write on the same mapping, so writers for one owner
//! are serialized; different owners proceed independently. Merge is the only
//! operation that holds two owner locks at once and it acquires them in
//! ascending owner-id order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AuthzError;
use crate::models::{AccountId, OwnerId, ResourceId};

/// A scalar metadata value. The stored mapping stays flat (string keys,
/// scalar values) so it serializes to portable key/value storage.
///
/// Untagged deserialization tries variants in order: `Timestamp` comes first
/// so RFC 3339-shaped strings are claimed as timestamps; everything else
/// falls through to `Str`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Timestamp(DateTime<Utc>),
    Str(String),
    Num(i64),
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Str(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Num(v)
    }
}

impl From<DateTime<Utc>> for MetadataValue {
    fn from(v: DateTime<Utc>) -> Self {
        MetadataValue::Timestamp(v)
    }
}

/// Provider-specific scope attached to a grant, e.g. `{"folder": "5"}`.
pub type GrantMetadata = BTreeMap<String, MetadataValue>;

/// What a revoke removed: the resources whose grants referenced the account,
/// and whether any other owner still links it. When `last_owner_reference`
/// is true the caller should trigger the best-effort remote revoke.
#[derive(Debug, Clone)]
pub struct RevokeOutcome {
    pub resources: Vec<ResourceId>,
    pub last_owner_reference: bool,
}

/// One owner's mutable state. Guarded by the owner mutex in [`GrantLedger`].
#[derive(Debug, Default)]
struct OwnerLedger {
    /// Accounts this owner has linked; membership gates `grant`.
    accounts: BTreeSet<AccountId>,
    /// resource -> account -> metadata.
    grants: BTreeMap<ResourceId, BTreeMap<AccountId, GrantMetadata>>,
}

#[derive(Default)]
pub struct GrantLedger {
    owners: Mutex<HashMap<OwnerId, Arc<Mutex<OwnerLedger>>>>,
}

impl GrantLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn owner(&self, owner: OwnerId) -> Arc<Mutex<OwnerLedger>> {
        let mut owners = self.owners.lock().await;
        owners.entry(owner).or_default().clone()
    }

    /// Record that `owner` holds `account`. Required before any grant.
    pub async fn link_account(&self, owner: OwnerId, account: AccountId) {
        let ledger = self.owner(owner).await;
        let mut ledger = ledger.lock().await;
        ledger.accounts.insert(account);
    }

    /// Drop the owner's link to `account` without touching grants. Callers
    /// that want grants removed too use [`GrantLedger::revoke`].
    pub async fn unlink_account(&self, owner: OwnerId, account: AccountId) {
        let ledger = self.owner(owner).await;
        let mut ledger = ledger.lock().await;
        ledger.accounts.remove(&account);
    }

    pub async fn owns(&self, owner: OwnerId, account: AccountId) -> bool {
        let ledger = self.owner(owner).await;
        let ledger = ledger.lock().await;
        ledger.accounts.contains(&account)
    }

    /// Grant `resource` use of `account`, merging `metadata` key-by-key into
    /// any existing entry. Existing keys absent from the new metadata are
    /// preserved; this is additive, never a full overwrite.
    pub async fn grant(
        &self,
        owner: OwnerId,
        resource: ResourceId,
        account: AccountId,
        metadata: GrantMetadata,
    ) -> Result<(), AuthzError> {
        let ledger = self.owner(owner).await;
        let mut ledger = ledger.lock().await;
        if !ledger.accounts.contains(&account) {
            return Err(AuthzError::NotOwned);
        }
        let entry = ledger
            .grants
            .entry(resource)
            .or_default()
            .entry(account)
            .or_default();
        for (key, value) in metadata {
            entry.insert(key, value);
        }
        debug!(owner = %owner, resource = %resource, account = %account, "grant recorded");
        Ok(())
    }

    /// With no requirement: is there an entry at all. With a requirement:
    /// is every required key/value pair present and equal.
    pub async fn verify(
        &self,
        owner: OwnerId,
        resource: ResourceId,
        account: AccountId,
        required: Option<&GrantMetadata>,
    ) -> bool {
        let ledger = self.owner(owner).await;
        let ledger = ledger.lock().await;
        let Some(stored) = ledger
            .grants
            .get(&resource)
            .and_then(|accounts| accounts.get(&account))
        else {
            return false;
        };
        match required {
            None => true,
            Some(required) => required
                .iter()
                .all(|(key, value)| stored.get(key) == Some(value)),
        }
    }

    /// Remove every grant referencing `account` and unlink it, in one pass
    /// under the owner mutex. Returns the affected resource ids so the caller
    /// can clear each resource's binding in the same transaction boundary.
    pub async fn revoke(&self, owner: OwnerId, account: AccountId) -> RevokeOutcome {
        let resources = {
            let ledger = self.owner(owner).await;
            let mut ledger = ledger.lock().await;
            let mut resources = Vec::new();
            ledger.grants.retain(|resource, accounts| {
                if accounts.remove(&account).is_some() {
                    resources.push(*resource);
                }
                !accounts.is_empty()
            });
            ledger.accounts.remove(&account);
            resources
        };

        let last_owner_reference = !self.linked_elsewhere(owner, account).await;
        info!(
            owner = %owner,
            account = %account,
            resources = resources.len(),
            last_owner_reference,
            "grants revoked"
        );
        RevokeOutcome {
            resources,
            last_owner_reference,
        }
    }

    async fn linked_elsewhere(&self, excluding: OwnerId, account: AccountId) -> bool {
        let others: Vec<Arc<Mutex<OwnerLedger>>> = {
            let owners = self.owners.lock().await;
            owners
                .iter()
                .filter(|(id, _)| **id != excluding)
                .map(|(_, ledger)| ledger.clone())
                .collect()
        };
        for ledger in others {
            let ledger = ledger.lock().await;
            if ledger.accounts.contains(&account) {
                return true;
            }
        }
        false
    }

    /// Fold `source`'s ledger into `dest` and clear `source`. Grants absent
    /// from dest are copied; for entries present in both, metadata merges
    /// additively with dest winning on key conflicts, since dest is the
    /// surviving identity. Linked accounts move to dest.
    pub async fn merge(&self, source: OwnerId, dest: OwnerId) {
        if source == dest {
            return;
        }
        let source_arc = self.owner(source).await;
        let dest_arc = self.owner(dest).await;

        // Two owner locks at once only here; ascending id order.
        let (mut source_ledger, mut dest_ledger) = if source < dest {
            let s = source_arc.lock().await;
            let d = dest_arc.lock().await;
            (s, d)
        } else {
            let d = dest_arc.lock().await;
            let s = source_arc.lock().await;
            (s, d)
        };

        let moved_accounts = std::mem::take(&mut source_ledger.accounts);
        dest_ledger.accounts.extend(moved_accounts);

        let moved_grants = std::mem::take(&mut source_ledger.grants);
        for (resource, accounts) in moved_grants {
            for (account, metadata) in accounts {
                let entry = dest_ledger
                    .grants
                    .entry(resource)
                    .or_default()
                    .entry(account)
                    .or_default();
                for (key, value) in metadata {
                    entry.entry(key).or_insert(value);
                }
            }
        }

        info!(source = %source, dest = %dest, "owner ledgers merged");
    }

    /// Clone the grant metadata for a fork of `resource`, but only when the
    /// forking actor is the owner who holds the grant. Anyone else's fork
    /// gets `None` and must start unauthorized.
    pub async fn fork(
        &self,
        owner: OwnerId,
        resource: ResourceId,
        account: AccountId,
        forking_owner: OwnerId,
    ) -> Option<GrantMetadata> {
        if forking_owner != owner {
            return None;
        }
        let ledger = self.owner(owner).await;
        let ledger = ledger.lock().await;
        ledger
            .grants
            .get(&resource)
            .and_then(|accounts| accounts.get(&account))
            .cloned()
    }

    /// Resource ids holding a grant for `account` under `owner`. A plain
    /// restartable snapshot with no hidden iteration state.
    pub async fn resources_with_grants(
        &self,
        owner: OwnerId,
        account: AccountId,
    ) -> Vec<ResourceId> {
        let ledger = self.owner(owner).await;
        let ledger = ledger.lock().await;
        ledger
            .grants
            .iter()
            .filter(|(_, accounts)| accounts.contains_key(&account))
            .map(|(resource, _)| *resource)
            .collect()
    }
}
