//! Core types and errors for splitmap
//!
//! This crate contains the fundamental types and error handling used
//! throughout the splitmap project. It provides:
//!
//! - Common error types with [`Error`] and [`Result`]
//! - Byte-oriented [`Key`] and [`Value`] aliases
//! - The [`HashFn`] and [`CompareFn`] function types callers plug into a
//!   table at construction time
//!
//! # Example
//!
//! ```
//! use splitmap_core::{Key, Value};
//!
//! let key: Key = b"user:123".to_vec();
//! let value: Value = b"John Doe".to_vec();
//! ```

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
