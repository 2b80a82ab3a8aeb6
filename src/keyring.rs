//! Stored-secret decryption
//!
//! Token shared secrets are stored either as plain base32 or as an
//! encrypted JSON envelope `{"kid", "nonce", "ct"}` referencing a named
//! key in a keyring loaded at startup. The HOTP engine only ever sees raw
//! bytes; this module isolates the optional-encryption policy.
//!
//! The decryptor is selected at construction time: with no keyring
//! configured it degrades to base32-only handling.

use std::collections::HashMap;
use std::fs;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::KeyringConfig;
use crate::{Error, Result};

/// Encrypted-secret envelope as stored in the directory.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Keyring entry that encrypted this secret
    kid: String,
    /// Base64 nonce (12 bytes)
    nonce: String,
    /// Base64 ciphertext + tag
    ct: String,
}

/// On-disk key file format.
#[derive(Debug, Deserialize)]
struct KeyFile {
    kid: String,
    /// Base64 key material (32 bytes)
    key: String,
}

/// Decodes/decrypts stored shared-secret blobs into raw key bytes.
pub enum Decryptor {
    /// No keyring configured: stored secrets must be plain base32
    Base32Only,
    /// Keyring of named decryption keys, immutable after startup
    Keyring(HashMap<String, Vec<u8>>),
}

impl Decryptor {
    /// Build a decryptor from configuration, loading key files once.
    ///
    /// # Errors
    ///
    /// Returns an error when a key file is unreadable, malformed, or holds
    /// key material of the wrong length.
    pub fn from_config(config: &KeyringConfig) -> Result<Self> {
        let Some(pattern) = &config.key_files else {
            return Ok(Self::Base32Only);
        };

        let mut keys = HashMap::new();
        let paths = glob::glob(pattern)
            .map_err(|e| Error::Config(format!("Invalid keyring glob {pattern}: {e}")))?;
        for path in paths {
            let path =
                path.map_err(|e| Error::Config(format!("Keyring glob error: {e}")))?;
            let raw = fs::read_to_string(&path)?;
            let file: KeyFile = serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("Malformed key file {}: {e}", path.display()))
            })?;
            let material = B64
                .decode(&file.key)
                .map_err(|e| Error::Config(format!("Key {} is not base64: {e}", file.kid)))?;
            if material.len() != 32 {
                return Err(Error::Config(format!(
                    "Key {} has {} bytes, expected 32",
                    file.kid,
                    material.len()
                )));
            }
            debug!(kid = %file.kid, path = %path.display(), "Loaded decryption key");
            keys.insert(file.kid, material);
        }

        info!(keys = keys.len(), "Decryption keyring loaded");
        Ok(Self::Keyring(keys))
    }

    /// Number of keys available for envelope decryption.
    #[must_use]
    pub fn key_count(&self) -> usize {
        match self {
            Self::Base32Only => 0,
            Self::Keyring(keys) => keys.len(),
        }
    }

    /// Decode/decrypt a stored secret blob into raw bytes.
    ///
    /// A blob that parses as an encrypted envelope is decrypted with the
    /// keyring; anything else is treated as plain base32.
    ///
    /// # Errors
    ///
    /// `Error::KeyNotFound` when the envelope references an absent key;
    /// `Error::Decode` on malformed base32, a malformed envelope, or
    /// failed authenticated decryption.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>> {
        let blob = blob.trim();
        if let Self::Keyring(keys) = self {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(blob) {
                return decrypt_envelope(&envelope, keys);
            }
        }
        decode_base32(blob)
    }
}

fn decrypt_envelope(envelope: &Envelope, keys: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let key = keys
        .get(&envelope.kid)
        .ok_or_else(|| Error::KeyNotFound(envelope.kid.clone()))?;
    let nonce = B64
        .decode(&envelope.nonce)
        .map_err(|e| Error::Decode(format!("envelope nonce: {e}")))?;
    if nonce.len() != 12 {
        return Err(Error::Decode(format!(
            "envelope nonce has {} bytes, expected 12",
            nonce.len()
        )));
    }
    let ciphertext = B64
        .decode(&envelope.ct)
        .map_err(|e| Error::Decode(format!("envelope ciphertext: {e}")))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: envelope.kid.as_bytes(),
            },
        )
        .map_err(|e| Error::Decode(format!("envelope decryption failed: {e}")))
}

/// Encrypt raw secret bytes into the envelope form `decrypt` accepts.
/// Used by provisioning tooling and the round-trip tests.
///
/// # Errors
///
/// Returns an error when `key` is not 32 bytes or encryption fails.
pub fn encrypt(secret: &[u8], kid: &str, key: &[u8]) -> Result<String> {
    if key.len() != 32 {
        return Err(Error::Config(format!(
            "Key {kid} has {} bytes, expected 32",
            key.len()
        )));
    }
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: secret,
                aad: kid.as_bytes(),
            },
        )
        .map_err(|e| Error::Internal(format!("envelope encryption failed: {e}")))?;

    let envelope = Envelope {
        kid: kid.to_string(),
        nonce: B64.encode(nonce_bytes),
        ct: B64.encode(ciphertext),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encode raw secret bytes as the base32 form `decrypt` accepts.
#[must_use]
pub fn encode_base32(secret: &[u8]) -> String {
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, secret)
}

fn decode_base32(blob: &str) -> Result<Vec<u8>> {
    // Accept both padded and unpadded forms; the alphabet is the same.
    let trimmed = blob.trim_end_matches('=');
    base32::decode(base32::Alphabet::RFC4648 { padding: false }, trimmed)
        .ok_or_else(|| Error::Decode("stored secret is not valid base32".to_string()))
}
