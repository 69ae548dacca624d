// ABOUTME: Token lifecycle manager — per-user state, single-flight refresh, background sweeper (C5).
// ABOUTME: The heart of the broker: every refresh, scheduled or on-demand, funnels through here.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Token lifecycle manager.
//!
//! Maintains one conceptual state machine per user:
//! `absent -> pending -> valid -> near-expiry -> refreshing -> valid | dead`.
//! A process-wide "currently refreshing" map enforces single-flight per user (P1);
//! the background sweeper and the request-path near-expiry trigger share the same
//! `trigger_refresh` entry point so there is exactly one refresh queue, not two.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{EngineError, EngineResult};
use crate::logging;
use crate::oauth_client::OAuthClient;
use crate::token_store::{TokenRecord, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Absent,
    Valid,
    NearExpiry,
    Refreshing,
    Dead,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Valid => "valid",
            Self::NearExpiry => "near-expiry",
            Self::Refreshing => "refreshing",
            Self::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    pub active_tokens: usize,
    pub expiring_soon: usize,
    pub expired: usize,
    pub refreshing: usize,
    pub total_refreshes: u64,
    pub max_users: usize,
}

struct RefreshSlot {
    notify: Arc<Notify>,
}

pub struct TokenManager {
    store: Arc<TokenStore>,
    client: Arc<OAuthClient>,
    refresh_threshold_seconds: i64,
    sweeper_interval_seconds: u64,
    refreshing: Mutex<std::collections::HashMap<String, RefreshSlot>>,
    known_users: DashMap<String, ()>,
    total_refreshes: AtomicU64,
    cancel: CancellationToken,
}

impl TokenManager {
    #[must_use]
    pub fn new(
        store: Arc<TokenStore>,
        client: Arc<OAuthClient>,
        refresh_threshold_seconds: i64,
        sweeper_interval_seconds: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            refresh_threshold_seconds,
            sweeper_interval_seconds,
            refreshing: Mutex::new(std::collections::HashMap::new()),
            known_users: DashMap::new(),
            total_refreshes: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the background sweeper. Returns a handle the engine joins on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(manager.sweeper_interval_seconds));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.sweep_once().await {
                            tracing::warn!(error = %e, "sweeper pass failed, continuing");
                        }
                    }
                    () = manager.cancel.cancelled() => {
                        tracing::info!("sweeper observed shutdown, stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn sweep_once(self: &Arc<Self>) -> EngineResult<()> {
        let now = Utc::now().timestamp();
        let user_ids: Vec<String> = self.known_users.iter().map(|e| e.key().clone()).collect();
        for user_id in user_ids {
            let Some(record) = self.store.get(&user_id)? else { continue };
            if record.refresh_token.is_none() {
                continue;
            }
            if record.expires_at <= now + self.refresh_threshold_seconds {
                let already_refreshing = self.refreshing.lock().await.contains_key(&user_id);
                if !already_refreshing {
                    self.trigger_refresh(user_id);
                }
            }
        }
        Ok(())
    }

    /// Register a freshly-created or loaded record so the sweeper and stats track it.
    pub fn register(&self, record: &TokenRecord) {
        self.known_users.insert(record.user_id.clone(), ());
    }

    #[must_use]
    pub fn state_of(&self, record: &TokenRecord, refreshing: bool) -> LifecycleState {
        let now = Utc::now().timestamp();
        if refreshing {
            return LifecycleState::Refreshing;
        }
        if record.is_expired(now) {
            return if record.refresh_token.is_some() {
                LifecycleState::NearExpiry
            } else {
                LifecycleState::Dead
            };
        }
        if now + self.refresh_threshold_seconds >= record.expires_at {
            LifecycleState::NearExpiry
        } else {
            LifecycleState::Valid
        }
    }

    /// Fetch a usable token, triggering a non-blocking background refresh on
    /// near-expiry. A caller that observes an already-expired record joins the
    /// single-flight refresh (starting it if none is in flight yet) and awaits its
    /// outcome, so it never hands back a token past its `expiresAt` (P2).
    pub async fn get(self: &Arc<Self>, user_id: &str) -> EngineResult<Option<TokenRecord>> {
        self.known_users.insert(user_id.to_string(), ());
        let Some(record) = self.store.get(user_id)? else { return Ok(None) };

        let now = Utc::now().timestamp();
        if record.is_expired(now) {
            if record.refresh_token.is_none() {
                return Ok(None);
            }
            return match self.refresh_with_retry(user_id).await {
                Ok(updated) => Ok(Some(updated)),
                Err(_) => Ok(None),
            };
        }

        if now + self.refresh_threshold_seconds >= record.expires_at {
            let already_refreshing = self.refreshing.lock().await.contains_key(user_id);
            if !already_refreshing {
                self.trigger_refresh(user_id.to_string());
            }
        }
        Ok(Some(record))
    }

    /// Spawn the single-flight refresh task for `user_id` in the background. Used
    /// by both the sweeper and the request-path near-expiry check — the single
    /// refresh queue the design notes call for.
    pub fn trigger_refresh(self: &Arc<Self>, user_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.refresh_with_retry(&user_id).await {
                tracing::debug!(user_id = %user_id, error = %e, "background refresh did not complete");
            }
        });
    }

    /// Force a refresh regardless of threshold (façade `refresh(userId)`), awaiting completion.
    pub async fn force_refresh(self: &Arc<Self>, user_id: &str) -> EngineResult<TokenRecord> {
        self.refresh_with_retry(user_id).await
    }

    async fn refresh_with_retry(self: &Arc<Self>, user_id: &str) -> EngineResult<TokenRecord> {
        let notify = {
            let mut guard = self.refreshing.lock().await;
            if let Some(slot) = guard.get(user_id) {
                let notify = Arc::clone(&slot.notify);
                // Register interest in the notification while still holding the guard
                // so the in-flight refresh can't finish and call `notify_waiters()` in
                // the gap between dropping the guard and awaiting `notified()` below —
                // `enable()` makes a wakeup that happens before the await permanent.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(guard);
                notified.await;
                return self.store.get(user_id)?.ok_or(EngineError::NoToken);
            }
            let notify = Arc::new(Notify::new());
            guard.insert(user_id.to_string(), RefreshSlot { notify: Arc::clone(&notify) });
            notify
        };

        let result = self.do_refresh(user_id).await;

        self.refreshing.lock().await.remove(user_id);
        notify.notify_waiters();
        result
    }

    async fn do_refresh(&self, user_id: &str) -> EngineResult<TokenRecord> {
        let Some(current) = self.store.get(user_id)? else { return Err(EngineError::NoToken) };
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(EngineError::RefreshTokenDead);
        };

        let max_attempts = crate::constants::time::MAX_REFRESH_ATTEMPTS;
        let mut last_err = EngineError::RefreshTokenDead;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
            match self.client.refresh(&refresh_token).await {
                Ok(response) => {
                    let updated = TokenRecord {
                        user_id: current.user_id.clone(),
                        access_token: response.access_token,
                        refresh_token: response.refresh_token.or_else(|| Some(refresh_token.clone())),
                        expires_at: response.expires_at,
                        scopes: if response.scopes.is_empty() { current.scopes.clone() } else { response.scopes },
                        is_max: response.is_max,
                        refresh_count: current.refresh_count + 1,
                        created_at: current.created_at,
                        last_used_at: Utc::now().timestamp(),
                    };
                    self.store.upsert(updated.clone())?;
                    self.total_refreshes.fetch_add(1, Ordering::Relaxed);
                    logging::log_refresh_event(user_id, attempt, true, updated.refresh_count);
                    return Ok(updated);
                }
                Err(EngineError::RefreshTokenDead) => {
                    logging::log_refresh_event(user_id, attempt, false, current.refresh_count);
                    self.store.delete(user_id)?;
                    self.known_users.remove(user_id);
                    return Err(EngineError::RefreshTokenDead);
                }
                Err(e) => {
                    logging::log_refresh_event(user_id, attempt, false, current.refresh_count);
                    last_err = e;
                }
            }
        }

        // Retries exhausted: the record transitions to dead and is removed from
        // both tiers so it cannot be replayed.
        self.store.delete(user_id)?;
        self.known_users.remove(user_id);
        Err(last_err)
    }

    pub fn revoke(&self, user_id: &str) {
        self.known_users.remove(user_id);
    }

    /// Snapshot the lifecycle state for `user_id` without touching the refresh queue.
    #[must_use]
    pub async fn lifecycle_state(&self, user_id: &str) -> LifecycleState {
        let Ok(Some(record)) = self.store.get(user_id) else { return LifecycleState::Absent };
        let refreshing = self.refreshing.lock().await.contains_key(user_id);
        self.state_of(&record, refreshing)
    }

    #[must_use]
    pub fn stats(&self) -> TokenStats {
        let now = Utc::now().timestamp();
        // try_lock rather than async: stats() is a best-effort snapshot called from
        // health/status handlers, not a point where blocking on a refresh is acceptable.
        let refreshing = self.refreshing.try_lock().map(|g| g.len()).unwrap_or(0);
        let mut stats = TokenStats {
            max_users: self.known_users.len(),
            total_refreshes: self.total_refreshes.load(Ordering::Relaxed),
            refreshing,
            ..TokenStats::default()
        };
        for entry in &self.known_users {
            if let Ok(Some(record)) = self.store.get(entry.key()) {
                if record.is_expired(now) {
                    stats.expired += 1;
                } else if now + self.refresh_threshold_seconds >= record.expires_at {
                    stats.expiring_soon += 1;
                } else {
                    stats.active_tokens += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthClientConfig;
    use tempfile::TempDir;

    fn manager_with(dir: &TempDir) -> (Arc<TokenManager>, Arc<TokenStore>) {
        let store = Arc::new(
            TokenStore::new(dir.path().to_path_buf(), crate::crypto::generate_data_key())
                .expect("store should initialize"),
        );
        let client = Arc::new(OAuthClient::new(OAuthClientConfig::default()));
        let manager = TokenManager::new(Arc::clone(&store), client, 300, 60);
        (manager, store)
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_user() {
        let dir = TempDir::new().expect("tempdir");
        let (manager, _store) = manager_with(&dir);
        let result = manager.get("nobody").await.expect("get should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_on_already_expired_record_joins_and_awaits_refresh() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = TempDir::new().expect("tempdir");
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A2",
                "refresh_token": "R2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let store = Arc::new(
            TokenStore::new(dir.path().to_path_buf(), crate::crypto::generate_data_key())
                .expect("store should initialize"),
        );
        let client = Arc::new(OAuthClient::new(OAuthClientConfig {
            token_url: format!("{}/v1/oauth/token", mock.uri()),
            refresh_url: format!("{}/v1/oauth/token", mock.uri()),
            ..OAuthClientConfig::default()
        }));
        let manager = TokenManager::new(Arc::clone(&store), client, 300, 60);

        let now = Utc::now().timestamp();
        let record = TokenRecord {
            user_id: "u1".to_string(),
            access_token: "A1".to_string(),
            refresh_token: Some("R1".to_string()),
            expires_at: now - 1,
            scopes: vec![],
            is_max: true,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        };
        manager.register(&record);
        store.upsert(record).expect("upsert should succeed");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.get("u1").await }));
        }
        for handle in handles {
            let fetched = handle.await.expect("task should not panic").expect("get should succeed");
            assert_eq!(fetched.expect("record present").access_token, "A2");
        }

        mock.verify().await;
    }

    #[tokio::test]
    async fn valid_token_is_served_without_refresh_trigger() {
        let dir = TempDir::new().expect("tempdir");
        let (manager, store) = manager_with(&dir);
        let now = Utc::now().timestamp();
        let record = TokenRecord {
            user_id: "u1".to_string(),
            access_token: "A".to_string(),
            refresh_token: Some("R".to_string()),
            expires_at: now + 7200,
            scopes: vec![],
            is_max: true,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        };
        manager.register(&record);
        store.upsert(record).expect("upsert should succeed");

        let fetched = manager.get("u1").await.expect("get should succeed").expect("record present");
        assert_eq!(fetched.access_token, "A");
        assert_eq!(manager.stats().active_tokens, 1);
    }

    #[tokio::test]
    async fn revoke_removes_user_from_stats() {
        let dir = TempDir::new().expect("tempdir");
        let (manager, store) = manager_with(&dir);
        let now = Utc::now().timestamp();
        let record = TokenRecord {
            user_id: "u2".to_string(),
            access_token: "A".to_string(),
            refresh_token: None,
            expires_at: now + 3600,
            scopes: vec![],
            is_max: true,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        };
        manager.register(&record);
        store.upsert(record).expect("upsert should succeed");
        assert_eq!(manager.stats().max_users, 1);

        manager.revoke("u2");
        assert_eq!(manager.stats().max_users, 0);
    }
}
