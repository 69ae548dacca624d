// ABOUTME: Auth service façade — the Engine. Orchestrates C2-C5 behind one explicit API (C6).
// ABOUTME: Constructed once at process init and shared by reference; no module-level singleton.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The `Engine`: a thin orchestrator over the flow store, OAuth client, token store,
//! and token manager. Replaces the distilled source's module-level singleton with an
//! explicitly constructed value held behind an `Arc` and passed by reference — into
//! Axum's `State` extractor and into the CLI alike.

use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::crypto;
use crate::errors::{EngineError, EngineResult};
use crate::flow_store::{FlowStore, TakeOutcome};
use crate::logging;
use crate::oauth_client::OAuthClient;
use crate::token_manager::{TokenManager, TokenStats};
use crate::token_store::{TokenRecord, TokenStore};

pub const MANUAL_ENTRY_STATE: &str = "manual_entry";

pub struct StartFlowResult {
    pub authorization_url: String,
    pub state: String,
    pub instructions: String,
}

pub struct Engine {
    config: EngineConfig,
    flow_store: FlowStore,
    oauth_client: Arc<OAuthClient>,
    token_store: Arc<TokenStore>,
    token_manager: Arc<TokenManager>,
    sweeper_handle: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Construct the engine, loading any bootstrap environment tokens and spawning
    /// the background sweeper. This is the one place a process builds an `Engine`;
    /// every caller (HTTP surface, CLI) receives an `Arc<Engine>` from here.
    pub fn new(config: EngineConfig) -> EngineResult<Arc<Self>> {
        let key = config.encryption_key.unwrap_or_else(|| {
            tracing::warn!(
                "no CLAUDE_TOKEN_ENCRYPTION_KEY configured; generating an ephemeral key. \
                 on-disk ciphertext will be unrecoverable after this process exits."
            );
            crypto::generate_data_key()
        });

        let flow_store = FlowStore::new(&config)?;
        let oauth_client = Arc::new(OAuthClient::new(config.oauth.clone()));
        let token_store = Arc::new(TokenStore::new(config.state_dir.clone(), key)?);
        let token_manager = TokenManager::new(
            Arc::clone(&token_store),
            Arc::clone(&oauth_client),
            config.refresh_threshold_seconds,
            config.sweeper_interval_seconds,
        );

        let sweeper_handle = token_manager.spawn_sweeper();

        let engine = Arc::new(Self {
            config,
            flow_store,
            oauth_client,
            token_store,
            token_manager,
            sweeper_handle,
        });

        engine.bootstrap_from_environment()?;
        Ok(engine)
    }

    /// Load `CLAUDE_ACCESS_TOKEN`/`CLAUDE_REFRESH_TOKEN`/`CLAUDE_EXPIRES_AT` if present,
    /// all-or-nothing, as a read-only fallback tier for bootstrapping a fresh deployment.
    fn bootstrap_from_environment(&self) -> EngineResult<()> {
        use crate::constants::env_vars;

        let access = std::env::var(env_vars::ACCESS_TOKEN).ok();
        let refresh = std::env::var(env_vars::REFRESH_TOKEN).ok();
        let expires_at = std::env::var(env_vars::EXPIRES_AT).ok();

        let (Some(access), Some(expires_at)) = (access, expires_at) else {
            return Ok(());
        };
        let Ok(expires_at) = expires_at.parse::<i64>() else {
            tracing::warn!("CLAUDE_EXPIRES_AT is set but not a valid unix timestamp; ignoring bootstrap tuple");
            return Ok(());
        };

        let now = Utc::now().timestamp();
        let record = TokenRecord {
            user_id: "default".to_string(),
            access_token: access,
            refresh_token: refresh,
            expires_at,
            scopes: Vec::new(),
            is_max: true,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        };
        self.token_store.upsert(record.clone())?;
        self.token_manager.register(&record);
        logging::log_oauth_event("default", "bootstrap_from_environment", true, 0);
        Ok(())
    }

    /// `startFlow(userId?)`: generate PKCE + CSRF state, persist to C2, build the
    /// authorize URL via C3. Returns a human-readable instruction block for the caller.
    pub fn start_flow(&self, user_id: Option<String>) -> EngineResult<StartFlowResult> {
        let pair = crypto::pkce_pair();
        let state = crypto::csrf_state();
        self.flow_store.put(&state, &pair.verifier, user_id)?;
        let authorization_url = self.oauth_client.build_authorize_url(&state, &pair.challenge);

        let instructions = format!(
            "Visit the following URL to authorize this application, then provide the \
             resulting code back to the callback endpoint with state={state}:\n{authorization_url}"
        );
        Ok(StartFlowResult { authorization_url, state, instructions })
    }

    /// `completeFlow(code, state) -> TokenRecord`. `state == "manual_entry"` is an
    /// opt-in bypass (disabled unless `allow_manual_entry` is set) that skips C2.take
    /// entirely since the code was hand-carried by the user out of band.
    pub async fn complete_flow(&self, user_id: &str, code: &str, state: &str) -> EngineResult<TokenRecord> {
        let start = std::time::Instant::now();

        let verifier = if state == MANUAL_ENTRY_STATE {
            if !self.config.allow_manual_entry {
                return Err(EngineError::StateUnknown);
            }
            String::new()
        } else {
            match self.flow_store.take(state)? {
                TakeOutcome::Found(flow) => flow.verifier,
                TakeOutcome::NotFound => return Err(EngineError::StateUnknown),
                TakeOutcome::Expired => return Err(EngineError::StateExpired),
            }
        };

        let response = self.oauth_client.exchange_code(code, &verifier, state).await?;
        let now = Utc::now().timestamp();
        let record = TokenRecord {
            user_id: user_id.to_string(),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response.expires_at,
            scopes: response.scopes,
            is_max: response.is_max,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        };
        self.token_store.upsert(record.clone())?;
        self.token_manager.register(&record);

        logging::log_oauth_event(user_id, "complete_flow", true, start.elapsed().as_millis() as u64);
        Ok(record)
    }

    /// `getAccessToken(userId?, autoRefresh, requireOAuth) -> token | null`.
    pub async fn get_access_token(&self, user_id: &str) -> EngineResult<Option<TokenRecord>> {
        self.token_manager.get(user_id).await
    }

    /// `refresh(userId) -> TokenRecord`, forced outside the near-expiry threshold.
    pub async fn refresh(&self, user_id: &str) -> EngineResult<TokenRecord> {
        self.token_manager.force_refresh(user_id).await
    }

    /// Current lifecycle state for `user_id`, for status/health surfaces.
    pub async fn lifecycle_state(&self, user_id: &str) -> crate::token_manager::LifecycleState {
        self.token_manager.lifecycle_state(user_id).await
    }

    /// `revoke(userId)`: tears down lifecycle tracking, the persistent record, and
    /// sweeps any stray pending flow state for good measure.
    pub fn revoke(&self, user_id: &str) -> EngineResult<()> {
        self.token_manager.revoke(user_id);
        self.token_store.delete(user_id)?;
        self.flow_store.sweep();
        logging::log_oauth_event(user_id, "revoke", true, 0);
        Ok(())
    }

    /// `headers(userId) -> {Authorization, <oauthBetaHeader>}`. Pure function over
    /// whatever the cache currently holds; never triggers a refresh.
    pub fn headers(&self, record: &TokenRecord) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", record.access_token)),
            (
                crate::constants::oauth::OAUTH_BETA_HEADER_NAME.to_string(),
                self.config.oauth.oauth_beta_header.clone(),
            ),
        ]
    }

    #[must_use]
    pub fn stats(&self) -> TokenStats {
        self.token_manager.stats()
    }

    #[must_use]
    pub fn allow_manual_entry(&self) -> bool {
        self.config.allow_manual_entry
    }

    #[must_use]
    pub fn allow_api_key_fallback(&self) -> bool {
        self.config.allow_api_key_fallback
    }

    #[must_use]
    pub fn refresh_threshold_seconds(&self) -> i64 {
        self.config.refresh_threshold_seconds
    }

    /// Stop the background sweeper and join it. Called once, at process shutdown.
    pub async fn shutdown(&self) {
        self.token_manager.shutdown();
        // The handle is not owned exclusively (Engine is usually behind an Arc), so
        // we can only request cancellation here; the caller holding the last Arc
        // reference is responsible for awaiting process exit. Best-effort abort
        // guards against a sweeper that ignores cancellation.
        if !self.sweeper_handle.is_finished() {
            self.sweeper_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with(dir: &TempDir) -> Arc<Engine> {
        let config = EngineConfig {
            state_dir: dir.path().to_path_buf(),
            encryption_key: Some(crypto::generate_data_key()),
            ..EngineConfig::default()
        };
        Engine::new(config).expect("engine should construct")
    }

    #[tokio::test]
    async fn start_flow_persists_state_and_builds_authorize_url() {
        let dir = TempDir::new().expect("tempdir");
        let engine = engine_with(&dir);
        let result = engine.start_flow(None).expect("start_flow should succeed");
        assert!(result.authorization_url.contains("code=true"));
        assert!(result.authorization_url.contains(&result.state));
    }

    #[tokio::test]
    async fn complete_flow_rejects_csrf_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let engine = engine_with(&dir);
        engine.start_flow(None).expect("start_flow should succeed");

        let err = engine
            .complete_flow("user-1", "CODE", "state-that-was-never-issued")
            .await
            .expect_err("mismatched state should fail");
        assert!(matches!(err, EngineError::StateUnknown));
    }

    #[tokio::test]
    async fn manual_entry_rejected_unless_opted_in() {
        let dir = TempDir::new().expect("tempdir");
        let engine = engine_with(&dir);
        let err = engine
            .complete_flow("user-1", "CODE", MANUAL_ENTRY_STATE)
            .await
            .expect_err("manual_entry should be rejected by default");
        assert!(matches!(err, EngineError::StateUnknown));
    }
}
