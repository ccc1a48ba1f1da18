//! Terminal HTTP handlers.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{ApiError, AppState};
use crate::auth::{is_alphanumeric, Principal};

use super::client;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "tabId")]
    tab_id: Option<String>,
}

/// GET /terminal/ws: upgrade to a terminal stream for one tab.
pub async fn terminal_ws(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let tab_id = query.tab_id.unwrap_or_else(|| "1".to_string());
    // The tab id ends up in a multiplexer session name and an engine exec
    // argument; reject anything but alphanumerics before going further.
    if !is_alphanumeric(&tab_id) {
        return Err(ApiError::bad_request("Invalid tab id"));
    }

    Ok(client::serve_ws(state.hub.clone(), principal, tab_id, ws).await)
}

#[derive(Debug, Deserialize)]
pub struct CloseTabRequest {
    #[serde(rename = "tabId", default)]
    tab_id: String,
}

/// POST /terminal/close-tab: kill the multiplexer session behind a tab.
pub async fn close_tab(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<CloseTabRequest>,
) -> Result<Json<Value>, ApiError> {
    let tab_id = if request.tab_id.is_empty() {
        "1".to_string()
    } else {
        request.tab_id
    };
    if !is_alphanumeric(&tab_id) {
        return Err(ApiError::bad_request("Invalid tab id"));
    }

    let Some(container) = state.hub.container_for_user(&principal.user_id).await else {
        return Err(ApiError::not_found("No container for user"));
    };

    match state.driver.kill_tab_session(&container, &tab_id).await {
        Ok(()) => Ok(Json(json!({ "message": "Terminated" }))),
        Err(err) => {
            // The session being gone already is the common case when the
            // user closed the shell themselves.
            warn!("failed to kill multiplexer session for tab {tab_id}: {err}");
            Ok(Json(json!({ "message": "No session or already terminated" })))
        }
    }
}
