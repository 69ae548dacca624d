// ABOUTME: Crypto primitives — PKCE pair generation, CSRF state tokens, envelope seal/open (C1).
// ABOUTME: AES-256-GCM with a random nonce prefixed to the ciphertext; version byte for rotation.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Crypto primitives for the token broker.
//!
//! `seal`/`open` implement the envelope encryption contract: a version byte followed by
//! a 12-byte nonce followed by the AES-256-GCM ciphertext (which includes the auth tag).
//! The version byte lets key rotation recognize the envelope format of older records
//! without guessing.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, EngineResult};

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct PkceMaterial {
    pub verifier: String,
    pub challenge: String,
}

/// Draw 32 uniform random bytes, URL-safe base64 (no padding) for the verifier, and
/// `SHA-256(verifier)` similarly encoded for the challenge. S256 is the only method.
#[must_use]
pub fn pkce_pair() -> PkceMaterial {
    let mut bytes = [0u8; crate::constants::pkce::VERIFIER_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    PkceMaterial { verifier, challenge }
}

/// 32 random bytes hex-encoded, for CSRF `state` round-tripped through the provider.
#[must_use]
pub fn csrf_state() -> String {
    let mut bytes = [0u8; crate::constants::pkce::STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Seal `plaintext` under `key` (AES-256-GCM, random nonce). Output: `version || nonce || ciphertext`.
pub fn seal(plaintext: &[u8], key: &[u8; 32]) -> EngineResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EngineError::CryptoRngFailure)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse of [`seal`]. Fails with [`EngineError::DecryptionError`] on any integrity
/// failure, mismatched key, unknown version, or truncated input.
pub fn open(envelope: &[u8], key: &[u8; 32]) -> EngineResult<Vec<u8>> {
    if envelope.len() < 1 + NONCE_LEN {
        return Err(EngineError::DecryptionError);
    }
    let version = envelope[0];
    if version != ENVELOPE_VERSION {
        return Err(EngineError::DecryptionError);
    }
    let nonce_bytes = &envelope[1..1 + NONCE_LEN];
    let ciphertext = &envelope[1 + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EngineError::DecryptionError)
}

/// Generate a fresh random 32-byte data key. Used for ephemeral bootstrapping and rotation.
#[must_use]
pub fn generate_data_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_sha256_of_verifier() {
        let pair = pkce_pair();
        let mut hasher = Sha256::new();
        hasher.update(pair.verifier.as_bytes());
        let expected = URL_SAFE_NO_PAD.encode(hasher.finalize());
        assert_eq!(pair.challenge, expected);
    }

    #[test]
    fn csrf_state_is_64_hex_chars() {
        let state = csrf_state();
        assert_eq!(state.len(), 64);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn seal_open_round_trips() {
        let key = generate_data_key();
        let plaintext = b"super-secret-access-token";
        let envelope = seal(plaintext, &key).expect("seal should succeed");
        let recovered = open(&envelope, &key).expect("open should succeed");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let key_a = generate_data_key();
        let key_b = generate_data_key();
        let envelope = seal(b"payload", &key_a).expect("seal should succeed");
        assert!(open(&envelope, &key_b).is_err());
    }

    #[test]
    fn open_fails_on_truncated_input() {
        let key = generate_data_key();
        assert!(open(&[1, 2, 3], &key).is_err());
    }
}
