//! Storage collaborator contracts
//!
//! The broker owns no persistence. It depends on two narrow stores — one
//! short-lived, per-actor store for in-flight handshakes, one durable
//! key-value store for account records — and ships in-memory implementations
//! of both for tests and embedding.

pub mod accounts;
pub mod handshake;

use thiserror::Error;

/// Opaque failure from a backing store.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);
