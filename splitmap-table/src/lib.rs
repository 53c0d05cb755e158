//! Lock-free, resizable concurrent hash table
//!
//! This crate implements a hash table over a single **split-ordered
//! linked list**: every bucket anchor and user node is chained in
//! ascending bit-reversed-hash order, so growing the table never moves a
//! node — a larger width merely reveals anchors that are already in
//! place. The pieces:
//!
//! - **Split-ordered list**: lock-free lookup, three insert modes,
//!   atomic replace, and two-phase removal with cooperative bucket GC
//! - **Bucket index + resizer**: a per-order vector of immutable level
//!   arrays of anchors; grow and shrink run concurrently with readers
//!   and writers
//! - **Grace-period reclamation**: readers hold a [`ReadGuard`] and
//!   never block; unlinked memory is freed only after every critical
//!   section that could see it has ended (see `splitmap-sync`)
//! - **Split counter**: sharded approximate population driving the
//!   automatic resize when [`TableFlags::AUTO_RESIZE`] is set
//!
//! # Example
//!
//! ```
//! use splitmap_table::{Table, TableConfig};
//!
//! let table = Table::with_default_sync(TableConfig::default())?;
//! let guard = table.read_lock();
//! table.add(&guard, b"key".to_vec(), b"value".to_vec());
//! let found = table.lookup(&guard, b"key");
//! assert_eq!(found.node().map(|n| n.value()), Some(&b"value"[..]));
//! # Ok::<(), splitmap_core::Error>(())
//! ```

mod bits;
mod config;
mod counter;
mod list;
mod node;
mod resize;
mod table;

pub use config::{default_compare, default_hash, TableConfig, TableFlags, MIN_TABLE_SIZE};
pub use node::Node;
pub use table::{AddOutcome, Iter, NodeCount, ReadGuard, Table};

pub use splitmap_core::{CompareFn, Error, HashFn, Key, Result, Value};
pub use splitmap_sync::{EpochSync, GraceSync};
