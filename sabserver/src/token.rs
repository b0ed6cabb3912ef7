//! Stream tokens: the only credential renderers ever see.
//!
//! A token is `base64url(payload_json) . base64url(hmac_sha256(payload))`
//! signed with the process session secret. Renderers embed it in the
//! stream URL; validation is stateless.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    pub item_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Unix seconds.
    pub expires_at: i64,
}

pub struct StreamTokenIssuer {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl StreamTokenIssuer {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_secs: ttl_secs as i64,
        }
    }

    pub fn generate(&self, item_id: &str, user_id: &str, session_id: &str) -> String {
        self.generate_with_ttl(item_id, user_id, session_id, self.ttl_secs)
    }

    pub fn generate_with_ttl(
        &self,
        item_id: &str,
        user_id: &str,
        session_id: &str,
        ttl_secs: i64,
    ) -> String {
        let payload = TokenPayload {
            item_id: item_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            expires_at: chrono::Utc::now().timestamp() + ttl_secs,
        };

        // Struct serialization cannot fail
        let payload_json = serde_json::to_vec(&payload).unwrap();
        let signature = self.sign(&payload_json);

        format!("{}.{}", B64.encode(&payload_json), B64.encode(signature))
    }

    /// Rejects malformed encodings, forged signatures (constant-time
    /// compare) and expired payloads, in that order.
    pub fn validate(&self, token: &str) -> Result<TokenPayload, TokenError> {
        let (payload_b64, signature_b64) =
            token.split_once('.').ok_or(TokenError::Malformed)?;

        let payload_json = B64.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
        let signature = B64
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(&payload_json);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload: TokenPayload =
            serde_json::from_slice(&payload_json).map_err(|_| TokenError::Malformed)?;

        if payload.expires_at < chrono::Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(payload)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> StreamTokenIssuer {
        StreamTokenIssuer::new("0123456789abcdef0123456789abcdef", 3600)
    }

    #[test]
    fn round_trip() {
        let issuer = issuer();
        let token = issuer.generate("item-1", "user-1", "sess-1");
        let payload = issuer.validate(&token).unwrap();
        assert_eq!(payload.item_id, "item-1");
        assert_eq!(payload.user_id, "user-1");
        assert_eq!(payload.session_id, "sess-1");
        assert!(payload.expires_at > chrono::Utc::now().timestamp());
    }

    #[test]
    fn tampered_payload_rejected() {
        let issuer = issuer();
        let token = issuer.generate("item-1", "user-1", "sess-1");
        let (payload_b64, signature_b64) = token.split_once('.').unwrap();

        let mut payload = B64.decode(payload_b64).unwrap();
        // Flip one byte inside the JSON
        payload[10] ^= 0x01;
        let forged = format!("{}.{}", B64.encode(&payload), signature_b64);

        assert_eq!(
            issuer.validate(&forged).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn foreign_secret_rejected() {
        let token = issuer().generate("item-1", "user-1", "sess-1");
        let other = StreamTokenIssuer::new("another-secret-another-secret-xx", 3600);
        assert_eq!(
            other.validate(&token).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn expired_token_rejected() {
        let issuer = issuer();
        let token = issuer.generate_with_ttl("item-1", "user-1", "sess-1", -5);
        assert_eq!(issuer.validate(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn garbage_is_malformed() {
        let issuer = issuer();
        assert_eq!(issuer.validate("").unwrap_err(), TokenError::Malformed);
        assert_eq!(issuer.validate("no-dot").unwrap_err(), TokenError::Malformed);
        assert_eq!(
            issuer.validate("!!!.###").unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn signature_checked_before_payload_shape() {
        // Valid base64 on both sides, wrong signature: must be the
        // signature error, not a JSON parse error
        let issuer = issuer();
        let fake = format!("{}.{}", B64.encode(b"not json"), B64.encode(b"sig"));
        assert_eq!(
            issuer.validate(&fake).unwrap_err(),
            TokenError::InvalidSignature
        );
    }
}
