//! Authentication: principals, signed session cookies and the persistent
//! user record store.
//!
//! The identity provider itself is an external collaborator; it hands over
//! a verified `{user_id, email}` at login. Everything downstream works with
//! the [`Principal`] extracted from the session cookie.

mod session;
mod storage;

pub mod handlers;

pub use session::{clear_session_cookie, session_cookie, SessionKey, SESSION_COOKIE_NAME};
pub use storage::{TerminalTabs, UserRecord, UserStore};

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{ApiError, AppState};

/// Authenticated identity presented at stream open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub port_start: u16,
}

impl Principal {
    /// Last port of the user's reserved range.
    pub fn port_end(&self) -> u16 {
        self.port_start + 9
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session cookie present")]
    MissingSession,

    #[error("invalid session token")]
    InvalidToken,

    #[error("session expired")]
    TokenExpired,

    #[error("authentication internal error: {0}")]
    Internal(String),
}

/// Shared authentication state.
#[derive(Clone)]
pub struct AuthState {
    pub key: SessionKey,
    pub store: Arc<UserStore>,
    /// Mark cookies `Secure` (production deployments behind TLS).
    pub secure_cookies: bool,
}

impl AuthState {
    pub fn new(key: SessionKey, store: UserStore, secure_cookies: bool) -> Self {
        Self {
            key,
            store: Arc::new(store),
            secure_cookies,
        }
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let cookie = jar
            .get(SESSION_COOKIE_NAME)
            .ok_or(AuthError::MissingSession)?;
        let principal = state.auth.key.verify(cookie.value())?;
        Ok(principal)
    }
}

/// Strictly `[A-Za-z0-9]+`; used for tab ids which get interpolated into
/// multiplexer session names.
pub fn is_alphanumeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// User ids come from the identity provider but flow into container names
/// and host paths, so constrain them the same way container names are.
pub fn is_valid_user_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_derivation() {
        let principal = Principal {
            user_id: "U1".to_string(),
            email: "u1@example.com".to_string(),
            port_start: 8000,
        };
        assert_eq!(principal.port_end(), 8009);
    }

    #[test]
    fn alphanumeric_check() {
        assert!(is_alphanumeric("1"));
        assert!(is_alphanumeric("tab2"));
        assert!(!is_alphanumeric(""));
        assert!(!is_alphanumeric("a-b"));
        assert!(!is_alphanumeric("a b"));
    }

    #[test]
    fn user_id_check() {
        assert!(is_valid_user_id("109876543210"));
        assert!(is_valid_user_id("user_a-1"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("../etc"));
        assert!(!is_valid_user_id("a;b"));
    }
}
