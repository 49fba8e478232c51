//! # DomainError
//!
//! Centralized error type shared by services and adapters.
//! Callers match on the variant; messages are for logs only.

use thiserror::Error;

/// The primary error type for all store, moderation and upkeep operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Target row absent (e.g., Post, Thread, log entry)
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// The store refused the action for the acting account
    #[error("no permission")]
    NoPermission,

    /// Request rejected before touching the store (e.g., deleting /all/)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Body re-parse failed with a non-recoverable error
    #[error("body parser failure: {0}")]
    ParserFailure(String),

    /// Any other transactional, store or media failure
    #[error("store failure: {0}")]
    StoreFailure(String),
}

impl DomainError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound(what, id.to_string())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreFailure(msg.into())
    }
}

/// A specialized Result type for domain logic.
pub type DomainResult<T> = std::result::Result<T, DomainError>;

/// Failure kinds reported by the external body parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The body itself is malformed; the post can still be closed without
    /// derived artifacts
    #[error("bad input: {0}")]
    BadInput(String),

    /// The parser is broken; the failure must be surfaced
    #[error("{0}")]
    Fatal(String),
}

impl From<ParseError> for DomainError {
    fn from(err: ParseError) -> Self {
        DomainError::ParserFailure(err.to_string())
    }
}
