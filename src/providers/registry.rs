//! Provider registry
//!
//! Maps provider short names to their configuration, callback hook, expiry
//! function, and client. Built once during startup and handed explicitly to
//! the handshake engine and the lifecycle manager.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::client::ProviderClient;
use super::{default_expiry, CallbackHook, ExpiryFn, ProviderConfig};

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("provider '{name}' not found")]
    ProviderNotFound { name: String },
}

/// Everything the broker knows about one provider.
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub hook: CallbackHook,
    pub expiry_fn: ExpiryFn,
    pub client: Arc<dyn ProviderClient>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a provider with the default expiry computation.
    pub fn register(
        &mut self,
        config: ProviderConfig,
        hook: CallbackHook,
        client: Arc<dyn ProviderClient>,
    ) {
        self.register_with_expiry(config, hook, Arc::new(default_expiry), client);
    }

    /// Register a provider that computes token expiry its own way.
    pub fn register_with_expiry(
        &mut self,
        config: ProviderConfig,
        hook: CallbackHook,
        expiry_fn: ExpiryFn,
        client: Arc<dyn ProviderClient>,
    ) {
        let name = config.short_name.clone();
        self.entries.insert(
            name,
            Arc::new(ProviderEntry {
                config,
                hook,
                expiry_fn,
                client,
            }),
        );
    }

    pub fn get(&self, short_name: &str) -> Result<Arc<ProviderEntry>, RegistryError> {
        self.entries
            .get(short_name)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: short_name.to_string(),
            })
    }

    /// Provider short names, sorted for stable ordering.
    pub fn short_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}
