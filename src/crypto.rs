//! AES-256-GCM payload encryption and content checksums.
//!
//! Context records are encrypted at rest with a process-wide key. The key
//! string is coerced to exactly 32 bytes (right-padded with `'0'`, truncated
//! past 32) rather than run through a KDF. Envelopes already written by
//! deployed instances depend on this exact coercion, so it must not change;
//! it does mean the key should be supplied as a full-entropy 32-character
//! string rather than a passphrase.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ContextError, Result};

/// Nonce length for AES-GCM (96 bits)
pub const NONCE_LEN: usize = 12;

/// Key length for AES-256 (256 bits)
pub const KEY_LEN: usize = 32;

/// Filler byte for short keys, matching the padding already baked into
/// stored envelopes
const KEY_PAD: u8 = b'0';

/// Process-wide encryption key, normalized to exactly [`KEY_LEN`] bytes.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Coerce a key string to 32 bytes: right-pad with `'0'` when shorter,
    /// truncate when longer.
    pub fn derive(key: &str) -> Self {
        let mut out = [KEY_PAD; KEY_LEN];
        let bytes = key.as_bytes();
        let n = bytes.len().min(KEY_LEN);
        out[..n].copy_from_slice(&bytes[..n]);
        Self(out)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt plaintext under the given key.
///
/// Draws a fresh random 12-byte nonce and returns the envelope
/// `base64(nonce || ciphertext)` as a single string.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ContextError::Crypto(format!("cipher init failed: {}", e)))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ContextError::Crypto("encryption failed".to_string()))?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Decrypt a `base64(nonce || ciphertext)` envelope.
///
/// Fails with [`ContextError::Crypto`] when the envelope is malformed (bad
/// base64, shorter than the nonce) or authentication fails (wrong key or
/// corrupted ciphertext). Callers must treat this as an unrecoverable read
/// failure for that object.
pub fn decrypt(envelope: &str, key: &EncryptionKey) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(envelope)
        .map_err(|e| ContextError::Crypto(format!("invalid envelope encoding: {}", e)))?;

    if raw.len() <= NONCE_LEN {
        return Err(ContextError::Crypto("envelope too short".to_string()));
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ContextError::Crypto(format!("cipher init failed: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ContextError::Crypto("decryption failed: wrong key or corrupted data".to_string()))
}

/// SHA-256 content checksum as lowercase hex. Integrity metadata only, not a
/// security boundary.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
