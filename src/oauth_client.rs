// ABOUTME: Stateless OAuth client — builds the authorize URL, exchanges codes, refreshes tokens (C3).
// ABOUTME: Talks JSON to the provider's token endpoint; normalizes expires_in to an absolute timestamp.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! OAuth client for the Claude authorization-code + PKCE flow.
//!
//! No per-user state lives here; every operation takes what it needs as arguments.
//! `reqwest` handles the network with the shared oauth-tuned client (30s timeout).

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::OAuthClientConfig;
use crate::constants::{oauth, time};
use crate::errors::{EngineError, EngineResult};

/// Normalized token response. The provider inconsistently uses `access_token` or
/// `accessToken` on the wire; serde aliasing absorbs both at this one boundary.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub is_max: bool,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(alias = "refreshToken", default)]
    refresh_token: Option<String>,
    #[serde(alias = "expiresIn", default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, rename = "is_max", alias = "isMax")]
    is_max: Option<bool>,
}

impl RawTokenResponse {
    fn normalize(self, received_at: DateTime<Utc>) -> TokenResponse {
        let expires_in = self.expires_in.unwrap_or(time::DEFAULT_TOKEN_EXPIRY_SECONDS);
        let expires_at = (received_at + Duration::seconds(expires_in)).timestamp();
        let scopes = self
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        TokenResponse {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            scopes,
            is_max: self.is_max.unwrap_or(true),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    code_verifier: &'a str,
    state: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    refresh_token: &'a str,
}

pub struct OAuthClient {
    config: OAuthClientConfig,
    http: Client,
}

impl OAuthClient {
    #[must_use]
    pub fn new(config: OAuthClientConfig) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(time::NETWORK_TIMEOUT_SECONDS))
            .connect_timeout(std::time::Duration::from_secs(time::NETWORK_CONNECT_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// `GET {authorizeUrl}?client_id=...&code_challenge=...&code=true`.
    #[must_use]
    pub fn build_authorize_url(&self, state: &str, challenge: &str) -> String {
        let scope = self.config.scopes.join(" ");
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code", oauth::CODE_LITERAL_PARAM)
            .finish();
        format!("{}?{query}", self.config.authorize_url)
    }

    /// Strip a trailing URL fragment/query the caller may have hand-carried along
    /// with the authorization code (browsers sometimes deliver `CODE#fragment`).
    #[must_use]
    pub fn sanitize_code(raw_code: &str) -> &str {
        raw_code
            .split('#')
            .next()
            .unwrap_or(raw_code)
            .split('&')
            .next()
            .unwrap_or(raw_code)
    }

    pub async fn exchange_code(&self, code: &str, verifier: &str, state: &str) -> EngineResult<TokenResponse> {
        let sanitized = Self::sanitize_code(code);
        let body = ExchangeRequest {
            grant_type: "authorization_code",
            client_id: &self.config.client_id,
            code: sanitized,
            redirect_uri: &self.config.redirect_uri,
            code_verifier: verifier,
            state,
        };

        let received_at = Utc::now();
        let response = self
            .http
            .post(&self.config.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&e, |status, body| EngineError::ExchangeError { status, body }))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ExchangeError { status: status.as_u16(), body });
        }

        let raw: RawTokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ExchangeError { status: status.as_u16(), body: e.to_string() })?;
        Ok(raw.normalize(received_at))
    }

    pub async fn refresh(&self, refresh_token: &str) -> EngineResult<TokenResponse> {
        let body = RefreshRequest {
            grant_type: "refresh_token",
            client_id: &self.config.client_id,
            refresh_token,
        };

        let received_at = Utc::now();
        let response = self
            .http
            .post(&self.config.refresh_url)
            .header(oauth::OAUTH_BETA_HEADER_NAME, &self.config.oauth_beta_header)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&e, |status, body| EngineError::RefreshError { status, body }))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(EngineError::RefreshTokenDead);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RefreshError { status: status.as_u16(), body });
        }

        let raw: RawTokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::RefreshError { status: status.as_u16(), body: e.to_string() })?;
        Ok(raw.normalize(received_at))
    }
}

fn network_error(e: &reqwest::Error, on_other: impl FnOnce(u16, String) -> EngineError) -> EngineError {
    if e.is_timeout() {
        EngineError::NetworkTimeout
    } else {
        on_other(0, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_code_strips_fragment_and_query_suffixes() {
        assert_eq!(OAuthClient::sanitize_code("CODE#garbage"), "CODE");
        assert_eq!(OAuthClient::sanitize_code("CODE&extra=1"), "CODE");
        assert_eq!(OAuthClient::sanitize_code("CODE"), "CODE");
    }

    #[test]
    fn authorize_url_includes_required_params() {
        let client = OAuthClient::new(OAuthClientConfig::default());
        let url = client.build_authorize_url("STATE123", "CHALLENGE456");
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("code=true"));
        assert!(url.contains("state=STATE123"));
        assert!(url.contains("code_challenge=CHALLENGE456"));
    }

    #[test]
    fn normalizes_aliased_field_names() {
        let raw: RawTokenResponse = serde_json::from_str(
            r#"{"accessToken":"A","refreshToken":"R","expiresIn":3600}"#,
        )
        .expect("should parse aliased payload");
        let normalized = raw.normalize(Utc::now());
        assert_eq!(normalized.access_token, "A");
        assert_eq!(normalized.refresh_token.as_deref(), Some("R"));
    }
}
