//! Grace-period synchronization for splitmap
//!
//! This crate implements the deferred-reclamation primitive the hash
//! table leans on for its read path:
//!
//! - **[`GraceSync`]**: the backend-neutral contract — read critical
//!   sections, `synchronize`, deferred callbacks, thread registration
//! - **[`EpochSync`]**: the shipped backend, detecting grace periods with
//!   a two-phase global epoch counter and per-thread reader words
//! - A worker thread, owned by the primitive, that batches deferred
//!   callbacks behind grace periods
//!
//! # Example
//!
//! ```
//! use splitmap_sync::{EpochSync, GraceSync};
//!
//! let sync = EpochSync::new();
//! sync.read_lock();
//! // ... traverse shared structures ...
//! sync.read_unlock();
//! sync.synchronize(); // every earlier critical section has ended
//! ```

mod epoch;
mod grace;
mod worker;

pub use epoch::EpochSync;
pub use grace::{Callback, GraceSync};
