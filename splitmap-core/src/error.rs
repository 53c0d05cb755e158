//! Error types for splitmap
//!
//! This module defines the error types surfaced by table operations.
//! Internal CAS failures are never surfaced: they are retried (or helped
//! along by cooperative garbage collection) inside the table itself.

use thiserror::Error;

/// The main error type for splitmap operations
#[derive(Error, Debug)]
pub enum Error {
    /// The target entry was already removed, or the key no longer exists
    #[error("entry not found")]
    NotFound,

    /// `destroy` was called while user entries remain in the table
    #[error("table still holds user entries")]
    NotEmpty,

    /// A caller-supplied argument was rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// A specialized Result type for splitmap operations
pub type Result<T> = std::result::Result<T, Error>;
