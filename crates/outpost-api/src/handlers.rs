//! API request handlers

pub mod account;
pub mod configuration_sets;
pub mod health;
pub mod identities;
pub mod messages;
pub mod send;
pub mod templates;
