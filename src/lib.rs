//! # OAuth Broker Library
//!
//! Credential-and-grant lifecycle core for third-party OAuth providers: the
//! handshake engine, the credential lifecycle manager, the authorization
//! grant ledger, and the resource binding service, plus the stores and
//! provider registry they plug into.

pub mod bindings;
pub mod config;
pub mod error;
pub mod handshake;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod providers;
pub mod secrets;
pub mod stores;
