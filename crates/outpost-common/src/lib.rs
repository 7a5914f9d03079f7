//! Outpost Common - Shared types and utilities
//!
//! This crate provides common types, configuration, and the error taxonomy
//! shared across all Outpost components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{EntityKind, Error, ErrorKind, Result};
