//! Outpost Storage - Reference data persistence
//!
//! Identities, configuration sets and templates live behind async
//! repository traits with an in-memory backend and a PostgreSQL backend.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
