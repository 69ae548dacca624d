// ABOUTME: Request interceptor — detects Claude-bound calls, injects bearer headers, retries on 401 (C8).
// ABOUTME: A pure helper the proxy binary wires around its own outbound HTTP calls.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Request interceptor.
//!
//! This module does not own an HTTP client of its own: it exposes pure detection
//! and header-shaping functions plus a retry-once orchestration helper that a host
//! proxy (out of scope; see purpose & scope) calls around its own outbound request.

use std::sync::Arc;

use crate::auth_service::Engine;
use crate::errors::{EngineError, EngineResult};

const API_KEY_HEADER: &str = "x-api-key";
const AUTHORIZATION_HEADER: &str = "authorization";

/// Error-body substrings that indicate the upstream considers the bearer invalid.
const UPSTREAM_AUTH_ERROR_MARKERS: &[&str] =
    &["token_expired", "invalid_token", "expired", "unauthorized"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthSignal {
    ExplicitOverride(bool),
    BearerCredential,
    EnvironmentFallback,
    None,
}

/// Detect whether a call should use OAuth, in priority order: explicit override,
/// the shape of a supplied credential, then the environment fallback.
#[must_use]
pub fn detect_oauth_signal(explicit_override: Option<bool>, credential: Option<&str>) -> OAuthSignal {
    if let Some(value) = explicit_override {
        return OAuthSignal::ExplicitOverride(value);
    }
    if let Some(cred) = credential {
        if cred.starts_with("Bearer ") && !cred.starts_with("sk-ant-") {
            return OAuthSignal::BearerCredential;
        }
    }
    if std::env::var(crate::constants::env_vars::ACCESS_TOKEN).is_ok() {
        return OAuthSignal::EnvironmentFallback;
    }
    OAuthSignal::None
}

/// Is this request bound for the Claude upstream? Matched by host suffix to avoid
/// false positives on unrelated third-party calls sharing the same process.
#[must_use]
pub fn is_claude_upstream(url: &str) -> bool {
    url.contains("api.anthropic.com") || url.contains("console.anthropic.com")
}

/// What the caller should do with its outbound headers after consulting the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    /// Inject this header set, removing any existing `x-api-key`/`authorization`.
    Apply(Vec<(String, String)>),
    /// No OAuth material on file, but fallback is permitted: leave the caller's
    /// existing `x-api-key` header (or whatever it already sent) untouched.
    PassThrough,
}

/// Build the header set to inject for an outbound Claude call, given the engine's
/// current bearer for `user_id`. Removes any `x-api-key`, the way the upstream
/// requires: OAuth bearer and API-key auth are mutually exclusive on the wire.
///
/// If no OAuth material is on file for `user_id`, the outcome depends on the
/// engine's fallback policy (C8): when fallback is permitted the caller's existing
/// API-key header is left alone ([`HeaderAction::PassThrough`]); when fallback is
/// disabled this fails closed with [`EngineError::OAuthRequired`].
pub async fn prepare_headers(engine: &Arc<Engine>, user_id: &str) -> EngineResult<HeaderAction> {
    match engine.get_access_token(user_id).await? {
        Some(record) => Ok(HeaderAction::Apply(engine.headers(&record))),
        None if engine.allow_api_key_fallback() => Ok(HeaderAction::PassThrough),
        None => Err(EngineError::OAuthRequired),
    }
}

#[must_use]
pub fn apply_headers(headers: &mut http::HeaderMap, prepared: &[(String, String)]) -> bool {
    use http::header::{HeaderName, HeaderValue};

    headers.remove(API_KEY_HEADER);
    headers.remove(AUTHORIZATION_HEADER);

    let mut applied = true;
    for (name, value) in prepared {
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) else {
            applied = false;
            continue;
        };
        headers.insert(name, value);
    }
    applied
}

/// Does an upstream response signal the bearer is no longer valid?
#[must_use]
pub fn signals_auth_failure(status: u16, body: &str) -> bool {
    if status == 401 {
        return true;
    }
    let lower = body.to_lowercase();
    UPSTREAM_AUTH_ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Retry-once orchestration: on an auth failure, force a refresh and signal the
/// caller to retry exactly once. Looping is prevented by the caller tracking
/// whether this is already a retry attempt.
pub async fn handle_auth_failure(
    engine: &Arc<Engine>,
    user_id: &str,
    already_retried: bool,
) -> EngineResult<bool> {
    if already_retried {
        return Ok(false);
    }
    engine.refresh(user_id).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_claude_upstream_hosts() {
        assert!(is_claude_upstream("https://api.anthropic.com/v1/messages"));
        assert!(is_claude_upstream("https://console.anthropic.com/v1/oauth/token"));
        assert!(!is_claude_upstream("https://example.com/v1/messages"));
    }

    #[test]
    fn signals_auth_failure_on_401_or_marker() {
        assert!(signals_auth_failure(401, ""));
        assert!(signals_auth_failure(400, "error: token_expired"));
        assert!(!signals_auth_failure(400, "bad request"));
    }

    #[test]
    fn explicit_override_wins_priority() {
        let signal = detect_oauth_signal(Some(true), Some("sk-ant-xyz"));
        assert_eq!(signal, OAuthSignal::ExplicitOverride(true));
    }

    #[test]
    fn bearer_credential_detected_when_not_api_key_shaped() {
        let signal = detect_oauth_signal(None, Some("Bearer abc123"));
        assert_eq!(signal, OAuthSignal::BearerCredential);
    }

    fn engine_with(dir: &tempfile::TempDir, allow_api_key_fallback: bool) -> Arc<Engine> {
        use crate::config::EngineConfig;
        let config = EngineConfig {
            state_dir: dir.path().to_path_buf(),
            encryption_key: Some(crate::crypto::generate_data_key()),
            allow_api_key_fallback,
            ..EngineConfig::default()
        };
        Engine::new(config).expect("engine should construct")
    }

    #[tokio::test]
    async fn prepare_headers_passes_through_when_no_token_and_fallback_permitted() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let engine = engine_with(&dir, true);

        let action = prepare_headers(&engine, "user-without-token")
            .await
            .expect("fallback should not error");
        assert_eq!(action, HeaderAction::PassThrough);
    }

    #[tokio::test]
    async fn prepare_headers_fails_closed_when_no_token_and_fallback_disabled() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let engine = engine_with(&dir, false);

        let err = prepare_headers(&engine, "user-without-token")
            .await
            .expect_err("fallback-disabled should fail closed");
        assert!(matches!(err, EngineError::OAuthRequired));
    }
}
