//! Credential state and token decoding helpers

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AdvisorError;

/// Tokens are renewed this long before their declared expiry.
pub const EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Builds a credential from freshly issued tokens. A refresh response may
    /// omit the refresh token; the previous one is kept in that case.
    pub fn issued(
        id_token: Option<String>,
        access_token: Option<String>,
        refresh_token: Option<String>,
        previous_refresh: Option<String>,
    ) -> Self {
        let expires_at = id_token
            .as_deref()
            .or(access_token.as_deref())
            .and_then(decode_token_expiry);
        Self {
            id_token,
            access_token,
            refresh_token: refresh_token.or(previous_refresh),
            expires_at,
        }
    }

    /// Bearer value sent upstream: identity token first, access token second.
    pub fn bearer(&self) -> Option<&str> {
        self.id_token.as_deref().or(self.access_token.as_deref())
    }

    /// Valid while a bearer exists, an expiry is known, and it lies beyond
    /// `now + EXPIRY_BUFFER_SECS`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (self.bearer(), self.expires_at) {
            (Some(_), Some(expires_at)) => now + Duration::seconds(EXPIRY_BUFFER_SECS) < expires_at,
            _ => false,
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Reads the `exp` claim from the middle segment of a JWT without verifying
/// the signature. Returns `None` for anything that does not decode.
pub fn decode_token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> crate::Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| AdvisorError::Config(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `base64(HMAC-SHA256(client_secret, username + client_id))`
pub fn secret_hash(username: &str, client_id: &str, client_secret: &str) -> crate::Result<String> {
    let message = format!("{}{}", username, client_id);
    let digest = hmac_sha256(client_secret.as_bytes(), message.as_bytes())?;
    Ok(STANDARD.encode(digest))
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"svc","exp":{}}}"#, exp));
    format!("{}.{}.sig", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_token_expiry() {
        let token = fake_jwt(1_900_000_000);
        let expiry = decode_token_expiry(&token).unwrap();
        assert_eq!(expiry.timestamp(), 1_900_000_000);

        assert!(decode_token_expiry("not-a-token").is_none());
        assert!(decode_token_expiry("a.!!!.c").is_none());
    }

    #[test]
    fn test_validity_honours_buffer() {
        let now = Utc::now();
        let soon = Credential::issued(Some(fake_jwt((now + Duration::seconds(180)).timestamp())), None, None, None);
        assert!(!soon.is_valid_at(now));

        let later = Credential::issued(Some(fake_jwt((now + Duration::hours(1)).timestamp())), None, None, None);
        assert!(later.is_valid_at(now));

        assert!(!Credential::default().is_valid_at(now));
    }

    #[test]
    fn test_issued_keeps_previous_refresh_token() {
        let cred = Credential::issued(None, Some("access".into()), None, Some("refresh".into()));
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(cred.bearer(), Some("access"));
    }

    #[test]
    fn test_secret_hash_is_stable_base64() {
        let a = secret_hash("user", "client", "secret").unwrap();
        let b = secret_hash("user", "client", "secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
        assert_ne!(a, secret_hash("user2", "client", "secret").unwrap());
    }
}
