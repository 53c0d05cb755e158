//! Configuration for the table
//!
//! Callers supply the hash and comparison functions; everything else has
//! defaults matching the tuning of the split counter and the chain-length
//! resize heuristic.

use std::hash::Hasher;

use bitflags::bitflags;
use fxhash::FxHasher;
use splitmap_core::{CompareFn, HashFn};

/// Split counters fold into the global count every `1 << COUNT_COMMIT_ORDER`
/// local operations.
pub(crate) const COUNT_COMMIT_ORDER: u32 = 10;

/// Bucket-chain length the automatic resize steers toward.
pub(crate) const CHAIN_LEN_TARGET: u32 = 1;

/// Bucket-chain length that triggers a grow on small tables.
pub(crate) const CHAIN_LEN_RESIZE_THRESHOLD: u32 = 3;

/// The table never shrinks below this width.
pub const MIN_TABLE_SIZE: usize = 1;

/// One level-array slot per possible bucket order.
pub(crate) const MAX_TABLE_ORDER: usize = usize::BITS as usize;

/// Largest publishable table width.
pub(crate) const MAX_TABLE_SIZE: usize = 1 << (MAX_TABLE_ORDER - 1);

/// Minimum number of anchors one worker touches when a resize is
/// parallelized.
pub(crate) const MIN_PARTITION_PER_THREAD_ORDER: u32 = 12;
pub(crate) const MIN_PARTITION_PER_THREAD: usize = 1 << MIN_PARTITION_PER_THREAD_ORDER;

bitflags! {
    /// Behavior flags for a table instance.
    pub struct TableFlags: u32 {
        /// Let the split counter and the chain-length heuristic schedule
        /// grows and shrinks in the background.
        const AUTO_RESIZE = 0b01;
    }
}

/// Configuration options for a table
///
/// # Example
///
/// ```
/// use splitmap_table::{TableConfig, TableFlags};
///
/// let config = TableConfig {
///     init_size: 64,
///     flags: TableFlags::AUTO_RESIZE,
///     ..Default::default()
/// };
/// assert!(config.init_size.is_power_of_two());
/// ```
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Hash function applied to keys
    pub hash: HashFn,

    /// Key equality
    pub compare: CompareFn,

    /// Seed mixed into every hash
    pub seed: usize,

    /// Initial table width; must be a power of two
    pub init_size: usize,

    /// Behavior flags
    pub flags: TableFlags,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            hash: default_hash,
            compare: default_compare,
            seed: 0,
            init_size: MIN_TABLE_SIZE,
            flags: TableFlags::empty(),
        }
    }
}

/// The default key hash: FxHash over the seed then the key bytes.
pub fn default_hash(key: &[u8], seed: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write_usize(seed);
    hasher.write(key);
    hasher.finish() as usize
}

/// The default key comparison: byte equality.
pub fn default_compare(a: &[u8], b: &[u8]) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TableConfig::default();
        assert_eq!(config.init_size, MIN_TABLE_SIZE);
        assert!(config.flags.is_empty());
        assert!((config.compare)(b"a", b"a"));
        assert!(!(config.compare)(b"a", b"b"));
    }

    #[test]
    fn test_default_hash_is_seeded() {
        let h0 = default_hash(b"key", 0);
        let h1 = default_hash(b"key", 1);
        assert_eq!(h0, default_hash(b"key", 0));
        assert_ne!(h0, h1);
    }
}
