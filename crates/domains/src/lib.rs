//! boardkeeper/crates/domains/src/lib.rs
//!
//! Domain models, errors and port traits for board upkeep and moderation.
//! This crate performs no I/O.

pub mod config;
pub mod errors;
pub mod models;
pub mod moderation;
pub mod ports;

// Re-exporting for easier access in other crates
pub use config::*;
pub use errors::*;
pub use models::*;
pub use moderation::*;
pub use ports::*;
