//! Pending-handshake store
//!
//! Short-lived, per-actor state for in-flight OAuth dances, keyed by
//! `(actor, provider)` with a TTL. Reads and writes for a given key are
//! atomic: a reader never observes a half-written state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::StoreError;
use crate::models::handshake_state::{HandshakeKey, HandshakeState};

#[async_trait]
pub trait PendingHandshakeStore: Send + Sync {
    /// Store pending state, overwriting any prior entry for the key.
    async fn put(
        &self,
        key: HandshakeKey,
        state: HandshakeState,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch pending state. Expired entries are treated as absent.
    async fn get(&self, key: &HandshakeKey) -> Result<Option<HandshakeState>, StoreError>;

    async fn delete(&self, key: &HandshakeKey) -> Result<(), StoreError>;
}

struct Entry {
    state: HandshakeState,
    expires_at: DateTime<Utc>,
}

/// In-memory pending-handshake store with TTL eviction.
#[derive(Default)]
pub struct InMemoryHandshakeStore {
    entries: Arc<Mutex<HashMap<HandshakeKey, Entry>>>,
}

impl InMemoryHandshakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Periodically purge expired entries until the shutdown token fires.
    pub async fn sweep(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_seconds = interval.as_secs(), "starting handshake state sweeper");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("handshake state sweeper shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    let removed = self.cleanup_expired().await;
                    if removed > 0 {
                        debug!(removed, "swept expired handshake states");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PendingHandshakeStore for InMemoryHandshakeStore {
    async fn put(
        &self,
        key: HandshakeKey,
        state: HandshakeState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError(format!("ttl out of range: {e}")))?;
        let mut entries = self.entries.lock().await;
        entries.insert(key, Entry { state, expires_at });
        Ok(())
    }

    async fn get(&self, key: &HandshakeKey) -> Result<Option<HandshakeState>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.state.clone()))
    }

    async fn delete(&self, key: &HandshakeKey) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}
