//! Core types used throughout splitmap
//!
//! Keys and values are opaque byte vectors; the table never interprets
//! them beyond the caller-supplied hash and comparison functions.

/// A key in the table, represented as a byte vector
pub type Key = Vec<u8>;

/// A value in the table, represented as a byte vector
pub type Value = Vec<u8>;

/// Hash function over a key, mixed with a per-table seed
pub type HashFn = fn(key: &[u8], seed: usize) -> usize;

/// Key equality; returns `true` when the two keys match
pub type CompareFn = fn(a: &[u8], b: &[u8]) -> bool;
