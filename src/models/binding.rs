//! Provider binding model
//!
//! A binding records which account a resource currently uses and with what
//! scope. It is a cache of permission, not the permission itself: the grant
//! ledger is the source of truth, and a binding may exist only when a
//! corresponding ledger entry does (enforced at write time by the binding
//! service).

use serde::{Deserialize, Serialize};

use crate::models::{AccountId, OwnerId, ResourceId};

/// A resource-specific selection on the provider, e.g. a chosen folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelection {
    pub id: String,
    pub name: Option<String>,
    pub path: Option<String>,
}

impl ScopeSelection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            path: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Derived connection state of a binding. Never stored; computed against a
/// live grant check so owner-side revocation is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    Unconfigured,
    Authorized,
    Scoped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub resource_id: ResourceId,
    pub provider: String,
    pub account_id: Option<AccountId>,
    /// The owner whose grant backs this binding.
    pub authorized_by: Option<OwnerId>,
    pub scope: Option<ScopeSelection>,
}

impl ProviderBinding {
    pub fn unconfigured(resource_id: ResourceId, provider: impl Into<String>) -> Self {
        Self {
            resource_id,
            provider: provider.into(),
            account_id: None,
            authorized_by: None,
            scope: None,
        }
    }

    /// Disconnect the binding from its account and scope. Does not touch the
    /// grant in the ledger.
    pub fn clear_auth(&mut self) {
        self.account_id = None;
        self.authorized_by = None;
        self.scope = None;
    }

    /// Drop the resource-specific selection, keeping the account link.
    pub fn clear_scope(&mut self) {
        self.scope = None;
    }
}
