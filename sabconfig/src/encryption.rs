//! Encryption of ABS API tokens at rest.
//!
//! Tokens stored in `bridge.db` are AES-256-GCM encrypted with a key derived
//! from the session secret. The nonce is random per encryption and prefixed
//! to the ciphertext, the whole blob base64-encoded. A decryption failure
//! means the secret was rotated (or the row corrupted); callers drop the
//! session in that case.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::Engine;
use sha2::{Digest, Sha256};

const KEY_SALT: &[u8] = b"sabridge-token-encryption-v1";

/// AES-256-GCM cipher bound to the process session secret.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Derives a 256-bit key from the session secret with SHA-256.
    pub fn new(session_secret: &str) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(session_secret.as_bytes());
        hasher.update(KEY_SALT);
        let key = hasher.finalize();

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        Ok(Self { cipher })
    }

    /// Encrypts a token. Output format: base64(nonce ‖ ciphertext).
    pub fn encrypt(&self, token: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypts a blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow!("Invalid base64: {}", e))?;

        if combined.len() < 12 {
            return Err(anyhow!("Invalid ciphertext (too short)"));
        }

        let nonce = Nonce::from_slice(&combined[..12]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &combined[12..])
            .map_err(|e| anyhow!("Decryption failed (rotated secret or corrupted data): {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new("a-session-secret-of-sufficient-length").unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher();
        let encrypted = c.encrypt("abs-api-token-xyz").unwrap();
        assert_ne!(encrypted, "abs-api-token-xyz");
        assert_eq!(c.decrypt(&encrypted).unwrap(), "abs-api-token-xyz");
    }

    #[test]
    fn nonce_is_random() {
        let c = cipher();
        let a = c.encrypt("same-token").unwrap();
        let b = c.encrypt("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails() {
        let encrypted = cipher().encrypt("token").unwrap();
        let other = TokenCipher::new("another-session-secret-entirely-now").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher();
        let encrypted = c.encrypt("token").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&encrypted)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn truncated_blob_fails() {
        let c = cipher();
        assert!(c.decrypt("AAAA").is_err());
        assert!(c.decrypt("not base64 at all!").is_err());
    }
}
