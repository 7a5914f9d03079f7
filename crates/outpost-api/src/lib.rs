//! Outpost REST API
//!
//! JSON over HTTP mapping of the `Mailer` boundary contract.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
