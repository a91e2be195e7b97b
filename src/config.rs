//! Configuration loading for the broker.
//!
//! Reads a `.env` file (when present) and environment variables prefixed with
//! `BROKER_`, producing a typed [`AppConfig`]. Process environment wins over
//! the `.env` layer.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application configuration derived from `BROKER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Lifetime of an in-flight handshake before the pending state is swept.
    #[serde(default = "default_handshake_ttl_seconds")]
    pub handshake_ttl_seconds: u64,
    /// Interval between sweeps of expired pending-handshake state.
    #[serde(default = "default_handshake_sweep_interval_seconds")]
    pub handshake_sweep_interval_seconds: u64,
    /// Deadline for any single outbound provider call (exchange/refresh/revoke).
    #[serde(default = "default_provider_call_timeout_ms")]
    pub provider_call_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_client_secret: Option<String>,
    #[serde(default = "default_box_auth_url")]
    pub box_auth_url: String,
    #[serde(default = "default_box_refresh_window_seconds")]
    pub box_refresh_window_seconds: u64,
    #[serde(default = "default_box_expiry_window_seconds")]
    pub box_expiry_window_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            handshake_ttl_seconds: default_handshake_ttl_seconds(),
            handshake_sweep_interval_seconds: default_handshake_sweep_interval_seconds(),
            provider_call_timeout_ms: default_provider_call_timeout_ms(),
            box_client_id: None,
            box_client_secret: None,
            box_auth_url: default_box_auth_url(),
            box_refresh_window_seconds: default_box_refresh_window_seconds(),
            box_expiry_window_seconds: default_box_expiry_window_seconds(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        let mut layered: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("BROKER_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        Self::from_layered(layered)
    }

    fn from_layered(mut layered: BTreeMap<String, String>) -> Self {
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let handshake_ttl_seconds = layered
            .remove("HANDSHAKE_TTL_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_handshake_ttl_seconds);
        let handshake_sweep_interval_seconds = layered
            .remove("HANDSHAKE_SWEEP_INTERVAL_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_handshake_sweep_interval_seconds);
        let provider_call_timeout_ms = layered
            .remove("PROVIDER_CALL_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_provider_call_timeout_ms);
        let box_client_id = layered
            .remove("BOX_CLIENT_ID")
            .filter(|v| !v.trim().is_empty());
        let box_client_secret = layered
            .remove("BOX_CLIENT_SECRET")
            .filter(|v| !v.trim().is_empty());
        let box_auth_url = layered
            .remove("BOX_AUTH_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_box_auth_url);
        let box_refresh_window_seconds = layered
            .remove("BOX_REFRESH_WINDOW_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_box_refresh_window_seconds);
        let box_expiry_window_seconds = layered
            .remove("BOX_EXPIRY_WINDOW_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_box_expiry_window_seconds);

        Self {
            log_level,
            handshake_ttl_seconds,
            handshake_sweep_interval_seconds,
            provider_call_timeout_ms,
            box_client_id,
            box_client_secret,
            box_auth_url,
            box_refresh_window_seconds,
            box_expiry_window_seconds,
        }
    }

    /// Pending-handshake TTL as a [`Duration`].
    pub fn handshake_ttl(&self) -> Duration {
        Duration::from_secs(self.handshake_ttl_seconds)
    }

    /// Outbound provider-call deadline as a [`Duration`].
    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_call_timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handshake_ttl_seconds() -> u64 {
    900
}

fn default_handshake_sweep_interval_seconds() -> u64 {
    300
}

fn default_provider_call_timeout_ms() -> u64 {
    10_000
}

fn default_box_auth_url() -> String {
    "https://account.box.com/api/oauth2/authorize".to_string()
}

fn default_box_refresh_window_seconds() -> u64 {
    // Box access tokens live for an hour; refresh at the halfway mark.
    1800
}

fn default_box_expiry_window_seconds() -> u64 {
    // Box refresh tokens die after 60 days of disuse.
    60 * 24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config = AppConfig::from_layered(BTreeMap::new());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.handshake_ttl_seconds, 900);
        assert_eq!(config.provider_call_timeout_ms, 10_000);
        assert!(config.box_client_id.is_none());
    }

    #[test]
    fn layered_values_override_defaults() {
        let mut layered = BTreeMap::new();
        layered.insert("LOG_LEVEL".to_string(), "debug".to_string());
        layered.insert("HANDSHAKE_TTL_SECONDS".to_string(), "60".to_string());
        layered.insert("BOX_CLIENT_ID".to_string(), "cid".to_string());

        let config = AppConfig::from_layered(layered);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.handshake_ttl_seconds, 60);
        assert_eq!(config.box_client_id.as_deref(), Some("cid"));
    }

    #[test]
    fn blank_credentials_are_treated_as_absent() {
        let mut layered = BTreeMap::new();
        layered.insert("BOX_CLIENT_ID".to_string(), "  ".to_string());
        let config = AppConfig::from_layered(layered);
        assert!(config.box_client_id.is_none());
    }
}
