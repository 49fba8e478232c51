//! boardkeeper/crates/storage-adapters/src/lib.rs
//!
//! Implementations of the `domains` storage ports:
//! PostgreSQL (feature `db-postgres`), an in-memory store and local media files.

pub mod media;
pub mod memory;

#[cfg(feature = "db-postgres")]
pub mod postgres;
