//! HTTP/WebSocket API server for Cinder CI.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
