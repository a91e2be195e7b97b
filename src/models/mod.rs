//! Data models shared across the broker.

pub mod binding;
pub mod external_account;
pub mod handshake_state;

use uuid::Uuid;

/// Identifier of an authorizing owner (e.g. a user).
pub type OwnerId = Uuid;

/// Identifier of a consuming resource (e.g. a node).
pub type ResourceId = Uuid;

/// Identifier of a stored external account.
pub type AccountId = Uuid;
