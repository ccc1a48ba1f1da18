//! Auth HTTP handlers.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use axum_extra::extract::CookieJar;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};

use super::{
    clear_session_cookie, is_alphanumeric, is_valid_user_id, session_cookie, Principal,
    TerminalTabs,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub email: String,
}

/// POST /auth/login: identity-provider seam: accepts the verified identity
/// and establishes the session cookie.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    if !is_valid_user_id(&request.user_id) {
        return Err(ApiError::bad_request("Invalid user id"));
    }
    if request.email.is_empty() {
        return Err(ApiError::bad_request("Email is required"));
    }

    let client_ip = client_ip(&headers);
    let record = state
        .auth
        .store
        .record_login(&request.user_id, &request.email, &client_ip)
        .await?;

    let principal = Principal {
        user_id: request.user_id.clone(),
        email: request.email,
        port_start: record.port_start,
    };
    let token = state.auth.key.issue(&principal)?;
    info!("user {} logged in from {client_ip}", request.user_id);

    Ok((
        jar.add(session_cookie(token, state.auth.secure_cookies)),
        Json(json!({
            "email": principal.email,
            "port_start": principal.port_start,
            "port_end": principal.port_end(),
        })),
    ))
}

/// GET /auth/logout: drop the session cookie.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Json<Value>) {
    (
        jar.add(clear_session_cookie(state.auth.secure_cookies)),
        Json(json!({})),
    )
}

/// GET /auth/me: the authenticated identity and its port range.
pub async fn me(principal: Principal) -> Json<Value> {
    Json(json!({
        "email": principal.email,
        "port_start": principal.port_start,
        "port_end": principal.port_end(),
    }))
}

/// GET /auth/users: all persisted user records.
pub async fn users(
    State(state): State<AppState>,
    _principal: Principal,
) -> Result<Json<Value>, ApiError> {
    let users = state.auth.store.all().await?;
    Ok(Json(serde_json::to_value(users).unwrap_or_default()))
}

/// GET /auth/tabs: the user's saved terminal tab layout.
pub async fn get_tabs(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>, ApiError> {
    if let Some(record) = state.auth.store.get(&principal.user_id).await? {
        if let Some(tabs) = record.terminal_tabs {
            let sanitized: Vec<String> = tabs
                .tabs
                .into_iter()
                .filter(|tab| is_alphanumeric(tab))
                .collect();
            if !sanitized.is_empty() && sanitized.contains(&tabs.active_tab) {
                return Ok(Json(json!({
                    "tabs": sanitized,
                    "active_tab": tabs.active_tab,
                })));
            }
        }
    }

    Ok(Json(json!({ "tabs": ["1"], "active_tab": "1" })))
}

#[derive(Debug, Deserialize)]
pub struct SaveTabsRequest {
    #[serde(default)]
    pub tabs: Vec<String>,
    #[serde(default)]
    pub active_tab: String,
}

/// POST /auth/tabs: persist the user's terminal tab layout.
pub async fn save_tabs(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<SaveTabsRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.tabs.is_empty() || request.active_tab.is_empty() {
        return Err(ApiError::bad_request(
            "Invalid data format. Expected 'tabs' array and 'active_tab' string.",
        ));
    }
    if !request.tabs.contains(&request.active_tab) {
        return Err(ApiError::bad_request("Active tab must be in the tabs list."));
    }

    let sanitized: Vec<String> = request
        .tabs
        .into_iter()
        .filter(|tab| is_alphanumeric(tab))
        .collect();
    if sanitized.is_empty() {
        return Err(ApiError::bad_request("No valid tab ids found."));
    }

    let active_tab = if sanitized.contains(&request.active_tab) {
        request.active_tab
    } else {
        sanitized[0].clone()
    };

    state
        .auth
        .store
        .save_terminal_tabs(
            &principal.user_id,
            TerminalTabs {
                tabs: sanitized,
                active_tab,
            },
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
