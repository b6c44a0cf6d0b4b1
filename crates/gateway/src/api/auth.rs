//! Bearer-token authentication.
//!
//! Tokens are issued by the external login service as
//! `<user_id>.<hex hmac-sha256(user_id)>` over a signing secret shared
//! through configuration. This side only validates: recompute the MAC and
//! compare in constant time, yielding the authenticated user id.

use axum::http::HeaderMap;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use td_domain::error::{Error, Result};

use super::api_error;

type HmacSha256 = Hmac<Sha256>;

/// HMAC key for token validation, read once at startup.
pub struct TokenKey {
    key: Vec<u8>,
}

impl TokenKey {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: secret.to_vec(),
        }
    }

    /// Sign a user id into a bearer token. The server never issues tokens
    /// in production; this mirrors the issuer for tests and local tooling.
    pub fn sign(&self, user_id: &str) -> String {
        format!("{user_id}.{}", hex::encode(self.mac_bytes(user_id)))
    }

    /// Validate a bearer token and return the user id it names.
    pub fn verify(&self, token: &str) -> Result<String> {
        let (user_id, mac_hex) = token
            .rsplit_once('.')
            .ok_or_else(|| Error::Auth("malformed token".into()))?;
        if user_id.is_empty() {
            return Err(Error::Auth("empty user id".into()));
        }

        let provided = hex::decode(mac_hex).map_err(|_| Error::Auth("malformed token".into()))?;
        let expected = self.mac_bytes(user_id);

        if !bool::from(provided.ct_eq(&expected)) {
            return Err(Error::Auth("invalid token signature".into()));
        }
        Ok(user_id.to_string())
    }

    fn mac_bytes(&self, user_id: &str) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(user_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Extract and validate the bearer credential from request headers.
/// Returns the authenticated user id, or a ready 401 response.
pub fn authenticate(key: &TokenKey, headers: &HeaderMap) -> std::result::Result<String, Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token.is_empty() {
        return Err(api_error(
            axum::http::StatusCode::UNAUTHORIZED,
            "missing bearer credential",
        ));
    }

    key.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer credential");
        api_error(
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid bearer credential",
        )
    })
}
