// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! End-to-end lifecycle tests against a stubbed OAuth provider.
//!
//! These exercise the `Engine` the way the HTTP and CLI surfaces both do, with the
//! upstream provider replaced by a `wiremock` server. Tests that read `CLAUDE_*`
//! environment variables run `#[serial]` since the bootstrap tuple is process-global.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use claude_oauth_broker::config::{EngineConfig, OAuthClientConfig};
use claude_oauth_broker::errors::EngineError;
use claude_oauth_broker::Engine;
use serial_test::serial;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(dir: &TempDir, mock: &MockServer) -> EngineConfig {
    EngineConfig {
        oauth: OAuthClientConfig {
            token_url: format!("{}/v1/oauth/token", mock.uri()),
            refresh_url: format!("{}/v1/oauth/token", mock.uri()),
            ..OAuthClientConfig::default()
        },
        state_dir: dir.path().to_path_buf(),
        encryption_key: Some(claude_oauth_broker::crypto::generate_data_key()),
        ..EngineConfig::default()
    }
}

fn clear_bootstrap_env() {
    for var in ["CLAUDE_ACCESS_TOKEN", "CLAUDE_REFRESH_TOKEN", "CLAUDE_EXPIRES_AT"] {
        std::env::remove_var(var);
    }
}

/// Scenario 1: cold start, startFlow, completeFlow with a fragment-suffixed code,
/// and the resulting bearer headers.
#[tokio::test]
#[serial]
async fn cold_start_flow_yields_bearer_headers() {
    clear_bootstrap_env();
    let dir = TempDir::new().expect("tempdir");
    let mock = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "A",
            "refresh_token": "R",
            "expires_in": 3600
        })))
        .mount(&mock)
        .await;

    let engine = Engine::new(config_for(&dir, &mock)).expect("engine should construct");
    let started = engine.start_flow(Some("user-1".to_string())).expect("start_flow should succeed");

    let record = engine
        .complete_flow("user-1", "CODE#garbage", &started.state)
        .await
        .expect("complete_flow should succeed");

    let headers = engine.headers(&record);
    assert!(headers.contains(&("Authorization".to_string(), "Bearer A".to_string())));
    assert!(headers.iter().any(|(k, v)| k == "anthropic-beta" && v == "oauth-2025-04-20"));
}

/// Scenario 2: a near-expiry record is served as-is on first read, then refreshed
/// in the background within a couple of sweeper ticks.
#[tokio::test]
#[serial]
async fn near_expiry_triggers_background_refresh() {
    std::env::set_var("CLAUDE_ACCESS_TOKEN", "A1");
    std::env::set_var("CLAUDE_REFRESH_TOKEN", "R1");
    std::env::set_var("CLAUDE_EXPIRES_AT", (Utc::now().timestamp() + 60).to_string());

    let dir = TempDir::new().expect("tempdir");
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "A2",
            "refresh_token": "R2",
            "expires_in": 3600
        })))
        .mount(&mock)
        .await;

    let mut config = config_for(&dir, &mock);
    config.refresh_threshold_seconds = 300;
    config.sweeper_interval_seconds = 1;
    let engine = Engine::new(config).expect("engine should construct");

    let first = engine.get_access_token("default").await.expect("get should succeed").expect("record present");
    assert_eq!(first.access_token, "A1");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let refreshed = engine.get_access_token("default").await.expect("get should succeed").expect("record present");
    assert_eq!(refreshed.access_token, "A2");
    assert_eq!(refreshed.refresh_count, 1);

    clear_bootstrap_env();
}

/// Scenario 3: the provider rejects the refresh token outright. The record is
/// torn down and a subsequent `get` observes it as gone.
#[tokio::test]
#[serial]
async fn dead_refresh_token_is_deleted() {
    std::env::set_var("CLAUDE_ACCESS_TOKEN", "A");
    std::env::set_var("CLAUDE_REFRESH_TOKEN", "R");
    std::env::set_var("CLAUDE_EXPIRES_AT", (Utc::now().timestamp() - 1).to_string());

    let dir = TempDir::new().expect("tempdir");
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock)
        .await;

    let engine = Engine::new(config_for(&dir, &mock)).expect("engine should construct");

    let err = engine.refresh("default").await.expect_err("dead refresh token should fail");
    assert!(matches!(err, EngineError::RefreshTokenDead));

    let after = engine.get_access_token("default").await.expect("get should succeed");
    assert!(after.is_none());

    clear_bootstrap_env();
}

/// Scenario 4: 100 concurrent callers for a near-expiry record collapse into
/// exactly one outbound refresh call, and every caller still gets a token back.
#[tokio::test]
#[serial]
async fn single_flight_collapses_concurrent_refreshes() {
    std::env::set_var("CLAUDE_ACCESS_TOKEN", "A1");
    std::env::set_var("CLAUDE_REFRESH_TOKEN", "R1");
    std::env::set_var("CLAUDE_EXPIRES_AT", (Utc::now().timestamp() - 1).to_string());

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

    let engine = Engine::new(config_for(&dir, &mock)).expect("engine should construct");

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine: Arc<Engine> = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.get_access_token("default").await }));
    }

    let mut all_present = true;
    for handle in handles {
        let result = handle.await.expect("task should not panic").expect("get should succeed");
        all_present &= result.is_some();
    }
    assert!(all_present);

    mock.verify().await;
    clear_bootstrap_env();
}

/// Scenario 5: replaying `completeFlow` against a state that was never issued
/// fails closed and leaves nothing behind.
#[tokio::test]
#[serial]
async fn csrf_replay_with_unknown_state_is_rejected() {
    clear_bootstrap_env();
    let dir = TempDir::new().expect("tempdir");
    let mock = MockServer::start().await;

    let engine = Engine::new(config_for(&dir, &mock)).expect("engine should construct");
    engine.start_flow(Some("user-1".to_string())).expect("start_flow should succeed");

    let err = engine
        .complete_flow("user-1", "CODE", "S-OTHER-NEVER-ISSUED")
        .await
        .expect_err("unknown state should be rejected");
    assert!(matches!(err, EngineError::StateUnknown));

    let record = engine.get_access_token("user-1").await.expect("get should succeed");
    assert!(record.is_none());
}
