//! Signed session cookies.
//!
//! The session token is a base64 JSON payload plus an HMAC-SHA256 tag:
//! `base64(payload).hex(hmac)`. No server-side session storage; the cookie
//! itself carries the principal.

use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{AuthError, Principal};

pub const SESSION_COOKIE_NAME: &str = "session";

/// Session lifetime, matching the cookie max-age.
const SESSION_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct SessionPayload {
    user_id: String,
    email: String,
    port_start: u16,
    exp: i64,
}

/// HMAC key for issuing and verifying session tokens.
#[derive(Clone)]
pub struct SessionKey {
    secret: Vec<u8>,
}

impl SessionKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a signed token for a principal.
    pub fn issue(&self, principal: &Principal) -> Result<String, AuthError> {
        let payload = SessionPayload {
            user_id: principal.user_id.clone(),
            email: principal.email.clone(),
            port_start: principal.port_start,
            exp: Utc::now().timestamp() + SESSION_TTL_SECS,
        };
        let raw = serde_json::to_vec(&payload)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(raw);
        let tag = self.sign(body.as_bytes())?;
        Ok(format!("{body}.{tag}"))
    }

    /// Verify a token and recover the principal.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let (body, tag) = token.split_once('.').ok_or(AuthError::InvalidToken)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        mac.update(body.as_bytes());
        let expected = hex::decode(tag).map_err(|_| AuthError::InvalidToken)?;
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::InvalidToken)?;

        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| AuthError::InvalidToken)?;
        let payload: SessionPayload =
            serde_json::from_slice(&raw).map_err(|_| AuthError::InvalidToken)?;

        if payload.exp < Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }

        Ok(Principal {
            user_id: payload.user_id,
            email: payload.email,
            port_start: payload.port_start,
        })
    }

    fn sign(&self, data: &[u8]) -> Result<String, AuthError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Build the session cookie carrying a token.
pub fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(time::Duration::seconds(SESSION_TTL_SECS));
    cookie
}

/// Build an expired cookie that clears the session.
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, "");
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(time::Duration::seconds(0));
    cookie
}
