// ABOUTME: PKCE flow-state store — persists pending (state -> verifier) tuples with TTL (C2).
// ABOUTME: One-shot `take` semantics so a replayed callback can never redeem a state twice.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! PKCE flow-state store.
//!
//! The OAuth callback is out-of-band: the engine loses control while the user
//! authenticates in the browser. This store survives that round trip on disk, one
//! file per pending flow, owner-readable only, and guarantees `take` succeeds at most
//! once per state (P5).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub state: String,
    pub verifier: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_id: Option<String>,
}

pub enum TakeOutcome {
    Found(FlowState),
    NotFound,
    Expired,
}

pub struct FlowStore {
    dir: PathBuf,
    ttl_seconds: i64,
}

impl FlowStore {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        fs::create_dir_all(&config.state_dir)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("creating state dir: {e}")))?;
        Ok(Self {
            dir: config.state_dir.clone(),
            ttl_seconds: config.flow_state_ttl_seconds,
        })
    }

    fn path_for(&self, state: &str) -> PathBuf {
        self.dir
            .join(format!("{}{state}.json", crate::constants::storage::FLOW_STATE_PREFIX))
    }

    /// Persist a `FlowState` with `expires_at = now + ttl_seconds`, mode 0600.
    pub fn put(&self, state: &str, verifier: &str, user_id: Option<String>) -> EngineResult<()> {
        let now = Utc::now().timestamp();
        let flow = FlowState {
            state: state.to_string(),
            verifier: verifier.to_string(),
            created_at: now,
            expires_at: now + self.ttl_seconds,
            user_id,
        };
        write_owner_only(&self.path_for(state), &flow)
    }

    /// Atomic read-and-delete. Never returns the same state twice: the file is
    /// removed as soon as it is read, before the expiry check, so a concurrent
    /// second caller observes `NotFound`.
    pub fn take(&self, state: &str) -> EngineResult<TakeOutcome> {
        let path = self.path_for(state);
        let contents = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TakeOutcome::NotFound),
            Err(e) => return Err(EngineError::Internal(anyhow::anyhow!("reading flow state: {e}"))),
        };
        // Remove immediately: a second concurrent `take` racing this one must see NotFound.
        let _ = fs::remove_file(&path);

        let flow: FlowState = serde_json::from_slice(&contents)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("parsing flow state: {e}")))?;

        if flow.expires_at <= Utc::now().timestamp() {
            return Ok(TakeOutcome::Expired);
        }
        Ok(TakeOutcome::Found(flow))
    }

    /// Best-effort removal of expired entries. Safe to call concurrently with `put`/`take`.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut cleaned = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_flow_state_file(&path) {
                continue;
            }
            if let Ok(contents) = fs::read(&path) {
                if let Ok(flow) = serde_json::from_slice::<FlowState>(&contents) {
                    if flow.expires_at <= now {
                        if fs::remove_file(&path).is_ok() {
                            cleaned += 1;
                        }
                        continue;
                    }
                }
            }
        }
        cleaned
    }
}

fn is_flow_state_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(crate::constants::storage::FLOW_STATE_PREFIX))
}

fn write_owner_only<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("serializing flow state: {e}")))?;
    fs::write(path, json).map_err(|e| EngineError::Internal(anyhow::anyhow!("writing flow state: {e}")))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("setting flow state permissions: {e}")))?;
    Ok(())
}
