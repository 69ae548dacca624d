// ABOUTME: Structured logging configuration and redaction-safe event helpers.
// ABOUTME: Wraps tracing-subscriber with environment-driven level/format selection.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Logging setup for the token broker.
//!
//! Call [`init`] once at process start. The only call sites permitted to log anything
//! token-shaped are the `log_*` helpers below, which accept booleans/counts/durations —
//! never a raw secret — by construction.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            service_name: service::NAME.to_string(),
            service_version: service::VERSION.to_string(),
            environment: "development".to_string(),
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => LogFormat::Pretty,
            };
        }
        if let Ok(env) = std::env::var("ENVIRONMENT").or_else(|_| std::env::var("NODE_ENV")) {
            config.environment = env;
        }
        config
    }
}

/// Initialize the global tracing subscriber. Safe to call once; subsequent calls are ignored.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(format!(
        "{},hyper=warn,reqwest=warn,tower_http=info,{}={}",
        config.level, service::NAME, config.level
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => {
            let _ = registry.with(fmt::layer().json().with_target(true)).try_init();
        }
        LogFormat::Pretty => {
            let _ = registry.with(fmt::layer().pretty()).try_init();
        }
        LogFormat::Compact => {
            let _ = registry.with(fmt::layer().compact()).try_init();
        }
    }
}

pub fn log_startup_info(config: &LoggingConfig, bind_addr: &str) {
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        bind_addr = %bind_addr,
        "starting claude oauth broker"
    );
}

/// Emit an OAuth lifecycle event. Never pass token material here — only shape/outcome.
pub fn log_oauth_event(user_id: &str, event: &str, success: bool, duration_ms: u64) {
    tracing::info!(
        user_id = %user_id,
        event = %event,
        success = success,
        duration_ms = duration_ms,
        "oauth event"
    );
}

/// Emit a refresh attempt outcome, tracking the running refresh count.
pub fn log_refresh_event(user_id: &str, attempt: u32, success: bool, refresh_count: u64) {
    tracing::info!(
        user_id = %user_id,
        attempt = attempt,
        success = success,
        refresh_count = refresh_count,
        "token refresh"
    );
}

/// Emit a security-relevant event (CSRF mismatch, decryption failure, dead refresh token).
pub fn log_security_event(event: &str, user_id: Option<&str>, detail: &str) {
    tracing::warn!(
        event = %event,
        user_id = user_id.unwrap_or("unknown"),
        detail = %detail,
        "security event"
    );
}
