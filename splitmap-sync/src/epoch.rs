//! Epoch-based grace-period detection
//!
//! Each registered reader owns one word combining a nesting count (low
//! bits) and a snapshot of the global phase bit. The outermost
//! `read_lock` copies the global counter into the reader word; nested
//! sections only bump the count. A grace period elapses once every
//! registered reader is observed either outside any critical section or
//! inside one that started after the current phase flip. Flipping twice
//! per `synchronize` closes the window where a reader observes the old
//! phase value just before the flip.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::grace::{Callback, GraceSync};
use crate::worker::GraceWorker;

/// Low bits of a reader word: critical-section nesting depth.
const NEST_MASK: usize = (1 << 16) - 1;
/// Nesting increment.
const NEST_ONE: usize = 1;
/// Phase bit, flipped by each half of a grace period.
const PHASE: usize = 1 << 16;

/// One registered reader thread.
struct Reader {
    /// Nesting count plus phase snapshot. Written only by the owning
    /// thread, read by `synchronize`.
    ctr: AtomicUsize,
}

impl Reader {
    /// A reader blocks the grace period while it sits in a critical
    /// section opened under the previous phase.
    fn blocks_grace(&self, gp_ctr: usize) -> bool {
        let v = self.ctr.load(Ordering::SeqCst);
        v & NEST_MASK != 0 && (v ^ gp_ctr) & PHASE != 0
    }
}

/// State shared between handles, reader threads, and the grace worker.
pub(crate) struct State {
    /// Global phase word copied by outermost `read_lock`. Carries
    /// NEST_ONE so the copy starts the reader at depth one.
    gp_ctr: AtomicUsize,
    /// Serializes grace periods.
    gp_lock: Mutex<()>,
    registry: Mutex<Vec<Arc<Reader>>>,
}

impl State {
    fn new() -> State {
        State {
            gp_ctr: AtomicUsize::new(NEST_ONE),
            gp_lock: Mutex::new(()),
            registry: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn synchronize(&self) {
        let _gp = self.gp_lock.lock();
        // Two phase flips: a reader that loaded the old gp_ctr but has not
        // yet stored its copy is attributed to at most one of them.
        for _ in 0..2 {
            self.gp_ctr.fetch_xor(PHASE, Ordering::SeqCst);
            let gp_ctr = self.gp_ctr.load(Ordering::SeqCst);
            let registry = self.registry.lock();
            for reader in registry.iter() {
                let mut spins = 0u32;
                while reader.blocks_grace(gp_ctr) {
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}

thread_local! {
    /// Per-thread registrations, one per synchronization domain this
    /// thread has touched. Entries unregister themselves on thread exit.
    static REGISTRATIONS: RefCell<Vec<Registration>> = const { RefCell::new(Vec::new()) };
}

struct Registration {
    state: Weak<State>,
    reader: Arc<Reader>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            let mut registry = state.registry.lock();
            registry.retain(|r| !Arc::ptr_eq(r, &self.reader));
        }
    }
}

/// The shipped [`GraceSync`] backend.
///
/// Threads register lazily on first use and unregister when they exit;
/// the explicit `register_thread`/`unregister_thread` calls remain
/// available for callers that want deterministic registry membership.
/// The deferred-callback worker thread belongs to this primitive and is
/// joined on drop, after running every callback still queued.
pub struct EpochSync {
    state: Arc<State>,
    worker: GraceWorker,
}

impl EpochSync {
    pub fn new() -> EpochSync {
        let state = Arc::new(State::new());
        let worker = GraceWorker::spawn(Arc::clone(&state));
        EpochSync { state, worker }
    }

    /// Finds (or creates) this thread's reader cell for this domain.
    fn reader(&self) -> Arc<Reader> {
        REGISTRATIONS.with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|reg| reg.state.strong_count() > 0);
            if let Some(reg) = slots
                .iter()
                .find(|reg| std::ptr::eq(reg.state.as_ptr(), Arc::as_ptr(&self.state)))
            {
                return Arc::clone(&reg.reader);
            }
            let reader = Arc::new(Reader {
                ctr: AtomicUsize::new(0),
            });
            self.state.registry.lock().push(Arc::clone(&reader));
            slots.push(Registration {
                state: Arc::downgrade(&self.state),
                reader: Arc::clone(&reader),
            });
            reader
        })
    }
}

impl Default for EpochSync {
    fn default() -> EpochSync {
        EpochSync::new()
    }
}

impl GraceSync for EpochSync {
    fn register_thread(&self) {
        self.reader();
    }

    fn unregister_thread(&self) {
        REGISTRATIONS.with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|reg| !std::ptr::eq(reg.state.as_ptr(), Arc::as_ptr(&self.state)));
        });
    }

    fn read_lock(&self) {
        let reader = self.reader();
        let ctr = reader.ctr.load(Ordering::Relaxed);
        if ctr & NEST_MASK == 0 {
            // Outermost: copy the global word (phase + depth one). The
            // SeqCst store pairs with the flip in synchronize.
            let gp_ctr = self.state.gp_ctr.load(Ordering::SeqCst);
            reader.ctr.store(gp_ctr, Ordering::SeqCst);
        } else {
            reader.ctr.store(ctr + NEST_ONE, Ordering::Relaxed);
        }
    }

    fn read_unlock(&self) {
        let reader = self.reader();
        let ctr = reader.ctr.load(Ordering::Relaxed);
        debug_assert_ne!(ctr & NEST_MASK, 0, "read_unlock outside a critical section");
        if ctr & NEST_MASK == NEST_ONE {
            reader.ctr.store(ctr - NEST_ONE, Ordering::SeqCst);
        } else {
            reader.ctr.store(ctr - NEST_ONE, Ordering::Relaxed);
        }
    }

    fn thread_offline(&self) {
        // This backend tracks critical sections directly, so a thread
        // outside any section is already quiescent. Keep the fence so the
        // thread's prior accesses are visible before it blocks.
        let reader = self.reader();
        debug_assert_eq!(
            reader.ctr.load(Ordering::Relaxed) & NEST_MASK,
            0,
            "thread_offline inside a critical section"
        );
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn thread_online(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn synchronize(&self) {
        let reader = self.reader();
        debug_assert_eq!(
            reader.ctr.load(Ordering::Relaxed) & NEST_MASK,
            0,
            "synchronize inside a critical section"
        );
        self.state.synchronize();
    }

    fn call_after_grace(&self, cb: Callback) {
        self.worker.defer(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_lock_nests() {
        let sync = EpochSync::new();
        sync.read_lock();
        sync.read_lock();
        sync.read_unlock();
        sync.read_unlock();
        // Quiescent again: synchronize must not block on ourselves.
        sync.synchronize();
    }

    #[test]
    fn test_synchronize_waits_for_preexisting_reader() {
        let sync = Arc::new(EpochSync::new());
        let released = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel();

        let reader_sync = Arc::clone(&sync);
        let reader_released = Arc::clone(&released);
        let reader = thread::spawn(move || {
            reader_sync.read_lock();
            entered_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            reader_released.store(true, Ordering::SeqCst);
            reader_sync.read_unlock();
        });

        entered_rx.recv().unwrap();
        sync.synchronize();
        // The critical section that started before synchronize must have
        // ended by the time it returns.
        assert!(released.load(Ordering::SeqCst));
        reader.join().unwrap();
    }

    #[test]
    fn test_call_after_grace_runs_callback() {
        let sync = EpochSync::new();
        let (tx, rx) = mpsc::channel();
        sync.call_after_grace(Box::new(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_drop_runs_pending_callbacks() {
        let sync = EpochSync::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            sync.call_after_grace(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        drop(sync);
        let mut got: Vec<i32> = rx.try_iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_register_unregister() {
        let sync = EpochSync::new();
        sync.register_thread();
        assert_eq!(sync.state.registry.lock().len(), 1);
        sync.unregister_thread();
        assert_eq!(sync.state.registry.lock().len(), 0);
    }

    #[test]
    fn test_domains_are_independent() {
        let a = EpochSync::new();
        let b = EpochSync::new();
        a.read_lock();
        // A reader in domain `a` must not block domain `b`.
        b.synchronize();
        a.read_unlock();
    }
}
