//! REST surface and router assembly.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{CreateRideResponse, HealthResponse};
pub use routes::create_router;
pub use state::AppState;
