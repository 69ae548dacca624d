// ABOUTME: Axum HTTP surface — the six REST endpoints the proxy layer calls (C7).
// ABOUTME: userId is derived upstream (proxy's own API key binding) and arrives as a header.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP surface for the token broker.
//!
//! Every route expects a prior proxy-layer authentication to have populated the
//! `x-broker-user-id` header; this engine does not implement that authentication
//! itself (see the purpose & scope non-goals).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth_service::Engine;
use crate::errors::{EngineError, EngineResult};

const USER_ID_HEADER: &str = "x-broker-user-id";
const DEFAULT_USER_ID: &str = "default";

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/auth/claude/start", post(start))
        .route("/auth/claude/callback", post(callback).get(callback_redirect))
        .route("/auth/claude/status", get(status))
        .route("/auth/claude/refresh", post(refresh))
        .route("/auth/claude/revoke", delete(revoke))
        .route("/auth/claude/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

fn user_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_USER_ID)
        .to_string()
}

#[derive(Serialize)]
struct StartResponse {
    authorization_url: String,
    state: String,
}

async fn start(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> Response {
    let user_id = user_id_from_headers(&headers);
    match engine.start_flow(Some(user_id)) {
        Ok(result) => {
            Json(StartResponse { authorization_url: result.authorization_url, state: result.state })
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct CallbackBody {
    code: Option<String>,
    state: Option<String>,
}

#[derive(Serialize)]
struct CallbackResponse {
    success: bool,
    expires_in: i64,
}

async fn callback(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Query(query): Query<CallbackBody>,
    body: Option<Json<CallbackBody>>,
) -> Response {
    let user_id = user_id_from_headers(&headers);
    let body = body.map(|Json(b)| b);
    let code = body.as_ref().and_then(|b| b.code.clone()).or(query.code);
    let state = body.as_ref().and_then(|b| b.state.clone()).or(query.state);

    let (Some(code), Some(state)) = (code, state) else {
        return EngineError::InvalidInput("missing required parameters: code and state".to_string())
            .into_response();
    };

    complete_and_respond(&engine, &user_id, &code, &state).await
}

/// Browsers can land here directly from the provider's redirect; render a minimal
/// HTML page instead of JSON so the flow is usable without a separate client.
async fn callback_redirect(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Query(query): Query<CallbackBody>,
) -> Response {
    let user_id = user_id_from_headers(&headers);
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Html(render_page(false, "Missing authorization code or state in the redirect.")).into_response();
    };

    match engine.complete_flow(&user_id, &code, &state).await {
        Ok(_) => Html(render_page(true, "Authentication complete. You may close this window.")).into_response(),
        Err(e) => Html(render_page(false, &e.sanitized_message())).into_response(),
    }
}

async fn complete_and_respond(engine: &Arc<Engine>, user_id: &str, code: &str, state: &str) -> Response {
    match engine.complete_flow(user_id, code, state).await {
        Ok(record) => {
            let expires_in = (record.expires_at - chrono::Utc::now().timestamp()).max(0);
            Json(CallbackResponse { success: true, expires_in }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn render_page(success: bool, message: &str) -> String {
    let title = if success { "Authentication Successful" } else { "Authentication Failed" };
    let color = if success { "#1a7f37" } else { "#d1242f" };
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head><body \
         style=\"font-family: sans-serif; text-align: center; padding-top: 4rem;\">\
         <h1 style=\"color: {color};\">{title}</h1><p>{message}</p></body></html>"
    )
}

#[derive(Serialize)]
struct StatusResponse {
    authenticated: bool,
    expires_in: Option<i64>,
    needs_refresh: bool,
    state: &'static str,
}

async fn status(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> EngineResult<Json<StatusResponse>> {
    let user_id = user_id_from_headers(&headers);
    let record = engine.get_access_token(&user_id).await?;
    let threshold = engine.refresh_threshold_seconds();
    let state = engine.lifecycle_state(&user_id).await.as_str();

    Ok(Json(match record {
        Some(record) => {
            let expires_in = (record.expires_at - chrono::Utc::now().timestamp()).max(0);
            StatusResponse {
                authenticated: true,
                expires_in: Some(expires_in),
                needs_refresh: expires_in < threshold,
                state,
            }
        }
        None => StatusResponse { authenticated: false, expires_in: None, needs_refresh: false, state },
    }))
}

#[derive(Serialize)]
struct RefreshResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn refresh(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> Response {
    let user_id = user_id_from_headers(&headers);
    match engine.refresh(&user_id).await {
        Ok(_) => Json(RefreshResponse { success: true, error: None }).into_response(),
        Err(e @ EngineError::NoToken | e @ EngineError::RefreshTokenDead) => (
            StatusCode::BAD_REQUEST,
            Json(RefreshResponse { success: false, error: Some(e.sanitized_message()) }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct RevokeResponse {
    success: bool,
}

async fn revoke(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> Response {
    let user_id = user_id_from_headers(&headers);
    match engine.revoke(&user_id) {
        Ok(()) => Json(RevokeResponse { success: true }).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    token_stats: TokenStatsResponse,
}

#[derive(Serialize)]
struct TokenStatsResponse {
    active_tokens: usize,
    expiring_soon: usize,
    expired: usize,
    refreshing: usize,
    total_refreshes: u64,
    max_users: usize,
}

async fn health(State(engine): State<Arc<Engine>>) -> Response {
    let stats = engine.stats();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            token_stats: TokenStatsResponse {
                active_tokens: stats.active_tokens,
                expiring_soon: stats.expiring_soon,
                expired: stats.expired,
                refreshing: stats.refreshing,
                total_refreshes: stats.total_refreshes,
                max_users: stats.max_users,
            },
        }),
    )
        .into_response()
}
