// ABOUTME: Named constants for the Claude OAuth broker — endpoints, timeouts, file layout.
// ABOUTME: Centralizing these avoids magic numbers scattered across the engine's components.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Constants shared across the token broker.

/// OAuth endpoint and client defaults, mirroring the upstream's published native client.
pub mod oauth {
    pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
    pub const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
    pub const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
    pub const DEFAULT_REFRESH_URL: &str = "https://console.anthropic.com/v1/oauth/token";
    pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
    pub const DEFAULT_SCOPES: &[&str] = &["org:create_api_key", "user:profile", "user:inference"];
    pub const OAUTH_BETA_HEADER_NAME: &str = "anthropic-beta";
    pub const OAUTH_BETA_HEADER_VALUE: &str = "oauth-2025-04-20";
    /// Literal query parameter the upstream authorize endpoint requires alongside PKCE params.
    pub const CODE_LITERAL_PARAM: &str = "true";
}

/// Timing defaults, overridable via `EngineConfig` / environment (see `config`).
pub mod time {
    pub const DEFAULT_REFRESH_THRESHOLD_SECONDS: i64 = 300;
    pub const FLOW_STATE_TTL_SECONDS: i64 = 600;
    pub const SWEEPER_INTERVAL_SECONDS: u64 = 60;
    pub const NETWORK_TIMEOUT_SECONDS: u64 = 30;
    pub const NETWORK_CONNECT_TIMEOUT_SECONDS: u64 = 10;
    pub const DEFAULT_TOKEN_EXPIRY_SECONDS: i64 = 3600;
    pub const MIN_CACHE_TTL_SECONDS: i64 = 60;
    pub const MAX_REFRESH_ATTEMPTS: u32 = 3;
}

/// PKCE generation parameters.
pub mod pkce {
    pub const VERIFIER_BYTES: usize = 32;
    pub const STATE_BYTES: usize = 32;
}

/// Persisted state file layout (reference file-backed implementation).
pub mod storage {
    pub const TOKENS_FILENAME: &str = "claude_tokens.json";
    pub const FLOW_STATE_PREFIX: &str = "claude_oauth_state_";
}

/// Environment variable names read once at process start.
pub mod env_vars {
    pub const ACCESS_TOKEN: &str = "CLAUDE_ACCESS_TOKEN";
    pub const REFRESH_TOKEN: &str = "CLAUDE_REFRESH_TOKEN";
    pub const EXPIRES_AT: &str = "CLAUDE_EXPIRES_AT";
    pub const ENCRYPTION_KEY: &str = "CLAUDE_TOKEN_ENCRYPTION_KEY";
    pub const OAUTH_CLIENT_ID: &str = "CLAUDE_OAUTH_CLIENT_ID";
    pub const OAUTH_REDIRECT_URI: &str = "CLAUDE_OAUTH_REDIRECT_URI";
    pub const ALLOW_MANUAL_ENTRY: &str = "CLAUDE_OAUTH_ALLOW_MANUAL_ENTRY";
    pub const REFRESH_THRESHOLD_SECONDS: &str = "CLAUDE_REFRESH_THRESHOLD_SECONDS";
    pub const STATE_DIR: &str = "CLAUDE_STATE_DIR";
    /// When set truthy, disables the C8 interceptor's API-key fallback: no OAuth
    /// material for a user becomes a hard `OAuthRequired` failure instead of a
    /// silent pass-through of the caller's existing API-key header.
    pub const REQUIRE_OAUTH: &str = "CLAUDE_OAUTH_REQUIRE";
}

/// Default service identity for structured logging and health responses.
pub mod service {
    pub const NAME: &str = "claude-oauth-broker";
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
