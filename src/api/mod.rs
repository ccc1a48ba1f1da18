//! HTTP surface: router assembly, shared state and error responses.

mod error;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
