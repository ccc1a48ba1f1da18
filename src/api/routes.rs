//! API route definitions.

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::handlers as auth_handlers;
use crate::files;
use crate::terminal::routes as terminal_routes;
use crate::webhook;

use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState, frontend_origin: &str, dev_mode: bool) -> Router {
    let cors = build_cors_layer(frontend_origin, dev_mode);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health))
        // Auth
        .route("/auth/login", post(auth_handlers::login))
        .route("/auth/logout", get(auth_handlers::logout))
        .route("/auth/me", get(auth_handlers::me))
        .route("/auth/users", get(auth_handlers::users))
        .route(
            "/auth/tabs",
            get(auth_handlers::get_tabs).post(auth_handlers::save_tabs),
        )
        // Terminal
        .route("/terminal/ws", get(terminal_routes::terminal_ws))
        .route("/terminal/close-tab", post(terminal_routes::close_tab))
        // Per-user file surface
        .route("/upload", post(files::upload))
        .route("/upload-folder", post(files::upload_folder))
        .route("/list-files", get(files::list_files))
        .route("/move", post(files::move_entry))
        .route(
            "/file/{*path}",
            get(files::get_file)
                .put(files::update_file)
                .delete(files::delete_file)
                .post(files::create_entry),
        )
        // Deployment webhook
        .route("/github-webhook", post(webhook::github_webhook))
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// CORS for the browser client: the configured frontend origin, plus
/// localhost defaults in development.
fn build_cors_layer(frontend_origin: &str, dev_mode: bool) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
    ];

    let mut origins: Vec<HeaderValue> = Vec::new();
    match frontend_origin.parse::<HeaderValue>() {
        Ok(value) => origins.push(value),
        Err(_) => tracing::warn!("CORS: invalid frontend origin: {frontend_origin}"),
    }
    if dev_mode {
        for origin in ["http://localhost:3000", "http://127.0.0.1:3000"] {
            if let Ok(value) = origin.parse::<HeaderValue>() {
                if !origins.contains(&value) {
                    origins.push(value);
                }
            }
        }
    }

    if origins.is_empty() {
        tracing::warn!("CORS: no valid origins configured, denying cross-origin requests");
        CorsLayer::new().allow_origin(HeaderValue::from_static("null"))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
