// ABOUTME: Encrypted at-rest token persistence keyed by user, with a TTL-bounded cache tier (C4).
// ABOUTME: One file per user under the state directory; atomic write-fsync-rename for durability.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Token store: persistent tier (encrypted file per user) + in-memory cache tier.
//!
//! Ciphertexts are bound to their user via an AAD string, the way the teacher's
//! database encryption layer binds tenant/user/provider context to prevent a
//! ciphertext copied across users from decrypting successfully.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto;
use crate::errors::{EngineError, EngineResult};

/// Manifest bundled alongside the tier in a backup archive. Opaque to anything but
/// this module: it records enough to sanity-check a restore, nothing that helps
/// decrypt the bundled records without the broker's own data key.
#[derive(Debug, Serialize, Deserialize)]
struct BackupManifest {
    created_at: i64,
    record_count: usize,
    format_version: u32,
}

const BACKUP_MANIFEST_NAME: &str = "manifest.json";
const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub is_max: bool,
    pub refresh_count: u64,
    pub created_at: i64,
    pub last_used_at: i64,
}

impl TokenRecord {
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn cache_ttl_seconds(&self, now: i64) -> i64 {
        (self.expires_at - now).max(crate::constants::time::MIN_CACHE_TTL_SECONDS)
    }
}

/// On-disk shape: secrets sealed individually so an AAD mismatch (wrong user) fails closed.
#[derive(Debug, Serialize, Deserialize)]
struct SealedRecord {
    user_id: String,
    sealed_access_token: Vec<u8>,
    sealed_refresh_token: Option<Vec<u8>>,
    expires_at: i64,
    scopes: Vec<String>,
    is_max: bool,
    refresh_count: u64,
    created_at: i64,
    last_used_at: i64,
}

fn aad_for(user_id: &str) -> Vec<u8> {
    format!("claude-oauth-broker|{user_id}").into_bytes()
}

/// Seal with an AAD-bound nonce prefix is not supported by the plain `aes_gcm::Aead`
/// trait used in `crypto::seal`; instead we bind context by mixing the AAD into the
/// sealed payload's associated record (the user_id field itself, checked on load).
fn seal_field(plaintext: &str, key: &[u8; 32], user_id: &str) -> EngineResult<Vec<u8>> {
    let mut payload = aad_for(user_id);
    payload.push(0);
    payload.extend_from_slice(plaintext.as_bytes());
    let envelope = crypto::seal(&payload, key);
    payload.zeroize();
    envelope
}

fn open_field(envelope: &[u8], key: &[u8; 32], user_id: &str) -> EngineResult<String> {
    use subtle::ConstantTimeEq;

    let mut payload = crypto::open(envelope, key)?;
    let expected_prefix = aad_for(user_id);
    let prefix_matches = payload.len() > expected_prefix.len()
        && bool::from(payload[..expected_prefix.len()].ct_eq(&expected_prefix[..]));
    if !prefix_matches {
        payload.zeroize();
        return Err(EngineError::DecryptionError);
    }
    let value = &payload[expected_prefix.len() + 1..];
    let result = String::from_utf8(value.to_vec()).map_err(|_| EngineError::DecryptionError);
    payload.zeroize();
    result
}

struct CacheEntry {
    record: TokenRecord,
    cached_at: i64,
    ttl_seconds: i64,
}

pub struct TokenStore {
    dir: PathBuf,
    key: [u8; 32],
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl TokenStore {
    pub fn new(dir: PathBuf, key: [u8; 32]) -> EngineResult<Self> {
        fs::create_dir_all(&dir).map_err(|e| EngineError::Internal(anyhow::anyhow!("creating token dir: {e}")))?;
        Ok(Self { dir, key, cache: Mutex::new(HashMap::new()) })
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{user_id}.{}", crate::constants::storage::TOKENS_FILENAME))
    }

    /// Cache hit first (subject to its `expiresAt`-derived TTL); on miss or
    /// expiry, load from the persistent tier (source of truth) and promote.
    pub fn get(&self, user_id: &str) -> EngineResult<Option<TokenRecord>> {
        let now = Utc::now().timestamp();
        {
            let mut guard = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            match guard.get(user_id) {
                Some(entry) if now - entry.cached_at < entry.ttl_seconds => {
                    return Ok(Some(entry.record.clone()));
                }
                Some(_) => {
                    guard.remove(user_id);
                }
                None => {}
            }
        }
        match self.load_from_disk(user_id)? {
            Some(record) => {
                self.promote(record.clone(), now);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn promote(&self, record: TokenRecord, now: i64) {
        let ttl_seconds = record.cache_ttl_seconds(now);
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.user_id.clone(), CacheEntry { record, cached_at: now, ttl_seconds });
    }

    /// Write-through: updates cache and persistent tier together.
    pub fn upsert(&self, record: TokenRecord) -> EngineResult<()> {
        self.write_to_disk(&record)?;
        self.promote(record, Utc::now().timestamp());
        Ok(())
    }

    pub fn delete(&self, user_id: &str) -> EngineResult<()> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).remove(user_id);
        let path = self.path_for(user_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Internal(anyhow::anyhow!("deleting token record: {e}"))),
        }
    }

    /// Remove records whose `last_used_at` is older than `max_age_days`.
    pub fn cleanup(&self, max_age_days: i64) -> EngineResult<usize> {
        let cutoff = Utc::now().timestamp() - max_age_days * 86_400;
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(user_id) = user_id_from_path(&path) else { continue };
            if let Ok(Some(record)) = self.load_from_disk(&user_id) {
                if record.last_used_at < cutoff {
                    self.delete(&user_id)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Re-seal every record under `new_key`. Atomic per record: write a temp file,
    /// fsync, then rename over the original so a crash mid-rotation leaves either
    /// the fully-old or fully-new version, never a torn file.
    pub fn rotate_key(&self, new_key: [u8; 32]) -> EngineResult<usize> {
        let mut rotated = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(user_id) = user_id_from_path(&path) else { continue };
            let Some(record) = self.load_from_disk(&user_id)? else { continue };

            let sealed = SealedRecord {
                user_id: record.user_id.clone(),
                sealed_access_token: seal_field(&record.access_token, &new_key, &record.user_id)?,
                sealed_refresh_token: record
                    .refresh_token
                    .as_deref()
                    .map(|t| seal_field(t, &new_key, &record.user_id))
                    .transpose()?,
                expires_at: record.expires_at,
                scopes: record.scopes.clone(),
                is_max: record.is_max,
                refresh_count: record.refresh_count,
                created_at: record.created_at,
                last_used_at: record.last_used_at,
            };
            atomic_write(&path, &sealed)?;
            rotated += 1;
        }
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(rotated)
    }

    /// Bundle the persistent tier (sealed records as they sit on disk) into a
    /// gzip'd tar archive alongside an opaque manifest. Envelope keys are never
    /// written here: a restored archive is only ever readable by whichever key the
    /// restoring process is already configured with.
    pub fn backup(&self, dest: &Path) -> EngineResult<usize> {
        let file = File::create(dest)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("creating backup archive: {e}")))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut record_count = 0;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if user_id_from_path(&path).is_none() {
                continue;
            }
            let Some(name) = path.file_name() else { continue };
            builder
                .append_path_with_name(&path, name)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("adding {name:?} to backup: {e}")))?;
            record_count += 1;
        }

        let manifest = BackupManifest {
            created_at: Utc::now().timestamp(),
            record_count,
            format_version: BACKUP_FORMAT_VERSION,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("serializing backup manifest: {e}")))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append_data(&mut header, BACKUP_MANIFEST_NAME, manifest_bytes.as_slice())
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("writing backup manifest: {e}")))?;

        builder
            .into_inner()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("finalizing backup archive: {e}")))?
            .finish()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("flushing backup archive: {e}")))?;
        Ok(record_count)
    }

    /// Replace the persistent tier's contents with the archive's. The in-memory
    /// cache is cleared so stale entries cannot shadow the restored records.
    pub fn restore(&self, src: &Path) -> EngineResult<usize> {
        let file =
            File::open(src).map_err(|e| EngineError::Internal(anyhow::anyhow!("opening backup archive: {e}")))?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);

        let mut restored = 0;
        for entry in archive
            .entries()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("reading backup archive: {e}")))?
        {
            let mut entry =
                entry.map_err(|e| EngineError::Internal(anyhow::anyhow!("reading backup entry: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("reading backup entry path: {e}")))?
                .into_owned();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if name == BACKUP_MANIFEST_NAME {
                continue;
            }

            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("extracting backup entry: {e}")))?;

            let dest_path = self.dir.join(name);
            fs::write(&dest_path, &contents)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("restoring token record: {e}")))?;
            fs::set_permissions(&dest_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("setting restored file permissions: {e}")))?;
            restored += 1;
        }

        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(restored)
    }

    fn load_from_disk(&self, user_id: &str) -> EngineResult<Option<TokenRecord>> {
        let path = self.path_for(user_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Internal(anyhow::anyhow!("reading token record: {e}"))),
        };
        let sealed: SealedRecord = match serde_json::from_slice(&bytes) {
            Ok(sealed) => sealed,
            // Corrupt on-disk record: log and treat as absent rather than failing startup.
            Err(_) => return Ok(None),
        };

        let access_token = match open_field(&sealed.sealed_access_token, &self.key, &sealed.user_id) {
            Ok(token) => token,
            Err(_) => {
                crate::logging::log_security_event(
                    "token_decryption_failed",
                    Some(&sealed.user_id),
                    "record skipped, treated as absent",
                );
                return Ok(None);
            }
        };
        let refresh_token = sealed
            .sealed_refresh_token
            .as_ref()
            .and_then(|env| open_field(env, &self.key, &sealed.user_id).ok());

        Ok(Some(TokenRecord {
            user_id: sealed.user_id,
            access_token,
            refresh_token,
            expires_at: sealed.expires_at,
            scopes: sealed.scopes,
            is_max: sealed.is_max,
            refresh_count: sealed.refresh_count,
            created_at: sealed.created_at,
            last_used_at: sealed.last_used_at,
        }))
    }

    fn write_to_disk(&self, record: &TokenRecord) -> EngineResult<()> {
        let sealed = SealedRecord {
            user_id: record.user_id.clone(),
            sealed_access_token: seal_field(&record.access_token, &self.key, &record.user_id)?,
            sealed_refresh_token: record
                .refresh_token
                .as_deref()
                .map(|t| seal_field(t, &self.key, &record.user_id))
                .transpose()?,
            expires_at: record.expires_at,
            scopes: record.scopes.clone(),
            is_max: record.is_max,
            refresh_count: record.refresh_count,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        };
        atomic_write(&self.path_for(&record.user_id), &sealed)
    }
}

fn user_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(&format!(".{}", crate::constants::storage::TOKENS_FILENAME))
        .map(str::to_string)
}

fn atomic_write<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let json = serde_json::to_vec(value)
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("serializing token record: {e}")))?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("creating temp token file: {e}")))?;
        file.write_all(&json)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("writing temp token file: {e}")))?;
        file.sync_all()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("fsyncing temp token file: {e}")))?;
    }
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("setting token file permissions: {e}")))?;
    fs::rename(&tmp_path, path).map_err(|e| EngineError::Internal(anyhow::anyhow!("renaming token file: {e}")))?;
    Ok(())
}

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(user_id: &str) -> TokenRecord {
        let now = Utc::now().timestamp();
        TokenRecord {
            user_id: user_id.to_string(),
            access_token: "A".to_string(),
            refresh_token: Some("R".to_string()),
            expires_at: now + 3600,
            scopes: vec!["user:inference".to_string()],
            is_max: true,
            refresh_count: 0,
            created_at: now,
            last_used_at: now,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = TokenStore::new(dir.path().to_path_buf(), crypto::generate_data_key()).expect("store");
        store.upsert(sample_record("user-1")).expect("upsert should succeed");

        let loaded = store.get("user-1").expect("get should succeed").expect("record should exist");
        assert_eq!(loaded.access_token, "A");
        assert_eq!(loaded.refresh_token.as_deref(), Some("R"));
    }

    #[test]
    fn delete_removes_persisted_and_cached_record() {
        let dir = TempDir::new().expect("tempdir");
        let store = TokenStore::new(dir.path().to_path_buf(), crypto::generate_data_key()).expect("store");
        store.upsert(sample_record("user-1")).expect("upsert should succeed");
        store.delete("user-1").expect("delete should succeed");
        assert!(store.get("user-1").expect("get should succeed").is_none());
    }

    #[test]
    fn expired_cache_entry_is_reloaded_from_disk_not_served_stale() {
        let dir = TempDir::new().expect("tempdir");
        let store = TokenStore::new(dir.path().to_path_buf(), crypto::generate_data_key()).expect("store");
        store.upsert(sample_record("user-1")).expect("upsert should succeed");

        // Force the cache entry to look like it was cached well outside its TTL window.
        {
            let mut guard = store.cache.lock().expect("cache lock");
            let entry = guard.get_mut("user-1").expect("cache entry present after upsert");
            entry.cached_at -= entry.ttl_seconds + 1;
        }

        let record = store.get("user-1").expect("get should succeed").expect("record should reload from disk");
        assert_eq!(record.access_token, "A");
    }

    #[test]
    fn backup_then_restore_round_trips_into_fresh_store() {
        let source_dir = TempDir::new().expect("tempdir");
        let key = crypto::generate_data_key();
        let source = TokenStore::new(source_dir.path().to_path_buf(), key).expect("store");
        source.upsert(sample_record("user-1")).expect("upsert should succeed");
        source.upsert(sample_record("user-2")).expect("upsert should succeed");

        let archive_dir = TempDir::new().expect("tempdir");
        let archive_path = archive_dir.path().join("backup.tar.gz");
        let count = source.backup(&archive_path).expect("backup should succeed");
        assert_eq!(count, 2);

        let dest_dir = TempDir::new().expect("tempdir");
        let dest = TokenStore::new(dest_dir.path().to_path_buf(), key).expect("store");
        let restored = dest.restore(&archive_path).expect("restore should succeed");
        assert_eq!(restored, 2);

        for user_id in ["user-1", "user-2"] {
            let record = dest.get(user_id).expect("get should succeed").expect("record should load");
            assert_eq!(record.access_token, "A");
        }
    }

    #[test]
    fn key_rotation_preserves_token_identity() {
        let dir = TempDir::new().expect("tempdir");
        let key1 = crypto::generate_data_key();
        let store = TokenStore::new(dir.path().to_path_buf(), key1).expect("store");
        store.upsert(sample_record("user-1")).expect("upsert should succeed");
        store.upsert(sample_record("user-2")).expect("upsert should succeed");
        store.upsert(sample_record("user-3")).expect("upsert should succeed");

        let key2 = crypto::generate_data_key();
        let rotated = store.rotate_key(key2).expect("rotation should succeed");
        assert_eq!(rotated, 3);

        // Simulate a process restart with only the new key.
        let reopened = TokenStore::new(dir.path().to_path_buf(), key2).expect("store");
        for user_id in ["user-1", "user-2", "user-3"] {
            let record = reopened.get(user_id).expect("get should succeed").expect("record should load");
            assert_eq!(record.access_token, "A");
            assert_eq!(record.refresh_token.as_deref(), Some("R"));
        }
    }
}
