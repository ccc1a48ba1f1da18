//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::container::ContainerDriver;
use crate::files::FilesConfig;
use crate::terminal::Hub;
use crate::webhook::WebhookConfig;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Terminal session orchestrator.
    pub hub: Arc<Hub>,
    /// Container engine driver, for operations outside the hub's reducer.
    pub driver: Arc<dyn ContainerDriver>,
    /// Authentication state.
    pub auth: AuthState,
    /// Per-user file surface configuration.
    pub files: FilesConfig,
    /// Deployment webhook configuration.
    pub webhook: WebhookConfig,
}
