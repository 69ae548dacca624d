// ABOUTME: Engine-wide configuration assembled once at process start from environment variables.
// ABOUTME: Defaults mirror the upstream's published native OAuth client and the timing contract.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration surface for the token broker.

use std::path::PathBuf;

use crate::constants::{env_vars, oauth, time};

/// Frozen OAuth client configuration — no per-user state (C3).
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub refresh_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub oauth_beta_header: String,
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            client_id: oauth::DEFAULT_CLIENT_ID.to_string(),
            authorize_url: oauth::DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: oauth::DEFAULT_TOKEN_URL.to_string(),
            refresh_url: oauth::DEFAULT_REFRESH_URL.to_string(),
            redirect_uri: oauth::DEFAULT_REDIRECT_URI.to_string(),
            scopes: oauth::DEFAULT_SCOPES.iter().map(|s| (*s).to_string()).collect(),
            oauth_beta_header: oauth::OAUTH_BETA_HEADER_VALUE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub oauth: OAuthClientConfig,
    pub refresh_threshold_seconds: i64,
    pub flow_state_ttl_seconds: i64,
    pub sweeper_interval_seconds: u64,
    pub network_timeout_seconds: u64,
    /// Root directory for persisted state (`claude_tokens.json`, pending flow files).
    pub state_dir: PathBuf,
    /// Opt-in bypass documented in the design notes: `state == "manual_entry"` skips CSRF.
    pub allow_manual_entry: bool,
    /// When no OAuth material is available for a user, the interceptor (C8) leaves
    /// the caller's `x-api-key` header untouched instead of failing. Default `true`;
    /// set false to require OAuth and fail closed with `OAuthRequired`.
    pub allow_api_key_fallback: bool,
    /// Raw 32-byte data key, if supplied out of band (base64 or raw via env).
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            oauth: OAuthClientConfig::default(),
            refresh_threshold_seconds: time::DEFAULT_REFRESH_THRESHOLD_SECONDS,
            flow_state_ttl_seconds: time::FLOW_STATE_TTL_SECONDS,
            sweeper_interval_seconds: time::SWEEPER_INTERVAL_SECONDS,
            network_timeout_seconds: time::NETWORK_TIMEOUT_SECONDS,
            state_dir: default_state_dir(),
            allow_manual_entry: false,
            allow_api_key_fallback: true,
            encryption_key: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-oauth-broker")
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(client_id) = std::env::var(env_vars::OAUTH_CLIENT_ID) {
            config.oauth.client_id = client_id;
        }
        if let Ok(redirect_uri) = std::env::var(env_vars::OAUTH_REDIRECT_URI) {
            config.oauth.redirect_uri = redirect_uri;
        }
        if let Ok(threshold) = std::env::var(env_vars::REFRESH_THRESHOLD_SECONDS) {
            if let Ok(parsed) = threshold.parse::<i64>() {
                config.refresh_threshold_seconds = parsed;
            }
        }
        if let Ok(dir) = std::env::var(env_vars::STATE_DIR) {
            config.state_dir = PathBuf::from(dir);
        }
        config.allow_manual_entry = std::env::var(env_vars::ALLOW_MANUAL_ENTRY)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        if let Ok(require_oauth) = std::env::var(env_vars::REQUIRE_OAUTH) {
            config.allow_api_key_fallback = !matches!(require_oauth.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(raw_key) = std::env::var(env_vars::ENCRYPTION_KEY) {
            config.encryption_key = decode_key(&raw_key);
        }

        config
    }

    #[must_use]
    pub fn tokens_file(&self) -> PathBuf {
        self.state_dir.join(crate::constants::storage::TOKENS_FILENAME)
    }

    #[must_use]
    pub fn flow_state_file(&self, state: &str) -> PathBuf {
        self.state_dir.join(format!(
            "{}{state}.json",
            crate::constants::storage::FLOW_STATE_PREFIX
        ))
    }
}

fn decode_key(raw: &str) -> Option<[u8; 32]> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let bytes = STANDARD.decode(raw.trim()).unwrap_or_else(|_| raw.as_bytes().to_vec());
    if bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Some(key)
    } else {
        None
    }
}
