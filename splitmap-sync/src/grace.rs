//! The grace-period contract
//!
//! Readers traverse shared structures inside *read critical sections*;
//! writers retire memory by waiting for (or deferring work past) a *grace
//! period*: an interval after which every read critical section that began
//! before the interval has ended. Nothing here prescribes how grace
//! periods are detected; any backend honoring the contract below works.

/// Deferred work to run on the grace worker, outside any critical section.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Grace-period synchronization operations.
///
/// A pointer loaded inside a read critical section stays valid until the
/// section ends, even if a writer has concurrently unlinked it, as long as
/// the writer frees it only after a grace period.
///
/// # Contract
///
/// - Read critical sections never block and may nest.
/// - [`synchronize`](GraceSync::synchronize) blocks until every read
///   critical section that started before the call has ended. It must not
///   be called from inside a read critical section.
/// - [`call_after_grace`](GraceSync::call_after_grace) runs the callback
///   on a dedicated worker after a grace period has elapsed; callbacks run
///   outside any caller's critical section.
/// - A thread about to block while holding a resource that
///   [`synchronize`](GraceSync::synchronize) may wait behind can declare
///   itself quiescent with [`thread_offline`](GraceSync::thread_offline)
///   and resume with [`thread_online`](GraceSync::thread_online).
pub trait GraceSync: Send + Sync + 'static {
    /// Registers the calling thread as a reader participant.
    fn register_thread(&self);

    /// Removes the calling thread from the reader registry.
    fn unregister_thread(&self);

    /// Enters a read critical section. Nests.
    fn read_lock(&self);

    /// Leaves the innermost read critical section.
    fn read_unlock(&self);

    /// Declares the calling thread quiescent until `thread_online`.
    fn thread_offline(&self);

    /// Ends a `thread_offline` span.
    fn thread_online(&self);

    /// Waits for a full grace period. Must not be called inside a read
    /// critical section.
    fn synchronize(&self);

    /// Enqueues `cb` to run on the grace worker after a grace period.
    fn call_after_grace(&self, cb: Callback);
}
