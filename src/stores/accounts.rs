//! Account repository
//!
//! Durable key-value persistence for [`ExternalAccount`] records. The
//! repository enforces the `(provider, provider_account_id)` uniqueness
//! invariant; the in-memory implementation backs the test suite and embedded
//! use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::StoreError;
use crate::models::external_account::ExternalAccount;
use crate::models::AccountId;

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find(&self, id: AccountId) -> Result<Option<ExternalAccount>, StoreError>;

    async fn find_by_remote_id(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> Result<Option<ExternalAccount>, StoreError>;

    /// Insert or update. Fails when the write would duplicate another
    /// account's `(provider, provider_account_id)` pair.
    async fn save(&self, account: &ExternalAccount) -> Result<(), StoreError>;

    async fn delete(&self, id: AccountId) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: Arc<Mutex<HashMap<AccountId, ExternalAccount>>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.lock().await.is_empty()
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn find(&self, id: AccountId) -> Result<Option<ExternalAccount>, StoreError> {
        let accounts = self.accounts.lock().await;
        Ok(accounts.get(&id).cloned())
    }

    async fn find_by_remote_id(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> Result<Option<ExternalAccount>, StoreError> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .values()
            .find(|acct| {
                acct.provider == provider && acct.provider_account_id == provider_account_id
            })
            .cloned())
    }

    async fn save(&self, account: &ExternalAccount) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().await;
        let duplicate = accounts.values().any(|existing| {
            existing.id != account.id
                && existing.provider == account.provider
                && existing.provider_account_id == account.provider_account_id
        });
        if duplicate {
            return Err(StoreError(format!(
                "duplicate account for ({}, {})",
                account.provider, account.provider_account_id
            )));
        }
        accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().await;
        accounts.remove(&id);
        Ok(())
    }
}
