// ABOUTME: Error taxonomy for the token broker and its translation to HTTP responses / CLI exit codes.
// ABOUTME: One error type spans the engine; each component-boundary failure is a variant here.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error handling for the OAuth broker.
//!
//! A single [`EngineError`] enum carries every failure kind named by the component
//! design: C1 crypto failures, C2 flow-state lookups, C3 OAuth exchanges, C4 storage.
//! HTTP handlers convert it via [`IntoResponse`]; the CLI maps it to an exit code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no token on file for this user")]
    NoToken,

    #[error("oauth state unknown or already consumed")]
    StateUnknown,

    #[error("oauth state expired")]
    StateExpired,

    #[error("token exchange failed: {status} {body}")]
    ExchangeError { status: u16, body: String },

    #[error("token refresh failed: {status} {body}")]
    RefreshError { status: u16, body: String },

    #[error("refresh token is no longer valid; a new flow is required")]
    RefreshTokenDead,

    #[error("failed to decrypt stored token")]
    DecryptionError,

    #[error("secure random number generator failed")]
    CryptoRngFailure,

    #[error("missing or invalid field: {0}")]
    InvalidInput(String),

    #[error("oauth credentials are required for this call but are not configured")]
    OAuthRequired,

    #[error("network timeout contacting the oauth provider")]
    NetworkTimeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NoToken | Self::OAuthRequired => StatusCode::UNAUTHORIZED,
            Self::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RefreshTokenDead => StatusCode::BAD_REQUEST,
            // Per the callback endpoint's contract, an unknown or expired oauth
            // state surfaces as a 500 with an explanatory body instructing the
            // caller to restart the flow, not a 422 (that's reserved for the
            // endpoint's own missing-parameter validation).
            Self::StateUnknown
            | Self::StateExpired
            | Self::ExchangeError { .. }
            | Self::RefreshError { .. }
            | Self::DecryptionError
            | Self::CryptoRngFailure
            | Self::NetworkTimeout
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a remote caller. Internal error bodies are never echoed
    /// verbatim except for the provider's own exchange/refresh diagnostics, which are
    /// already public-facing HTTP responses from the oauth provider.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::ExchangeError { status, body } => {
                format!("token exchange rejected by provider ({status}): {body}")
            }
            Self::RefreshError { status, body } => {
                format!("token refresh rejected by provider ({status}): {body}")
            }
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// CLI exit code per the external-interfaces contract: 0 ok, 1 expected failure, 2 usage error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: Uuid,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4();
        tracing::warn!(
            error = %self,
            request_id = %request_id,
            "request failed"
        );
        let body = ErrorResponse {
            error: variant_name(&self).to_string(),
            message: self.sanitized_message(),
            request_id,
        };
        (self.http_status(), Json(body)).into_response()
    }
}

fn variant_name(err: &EngineError) -> &'static str {
    match err {
        EngineError::NoToken => "NoToken",
        EngineError::StateUnknown => "StateUnknown",
        EngineError::StateExpired => "StateExpired",
        EngineError::ExchangeError { .. } => "ExchangeError",
        EngineError::RefreshError { .. } => "RefreshError",
        EngineError::RefreshTokenDead => "RefreshTokenDead",
        EngineError::DecryptionError => "DecryptionError",
        EngineError::CryptoRngFailure => "CryptoRNGFailure",
        EngineError::InvalidInput(_) => "InvalidInput",
        EngineError::OAuthRequired => "OAuthRequired",
        EngineError::NetworkTimeout => "NetworkTimeout",
        EngineError::Internal(_) => "Internal",
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
