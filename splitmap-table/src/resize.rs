//! Growing and shrinking under live traffic
//!
//! Growing from `2^a` to `2^b` installs one level array per new order:
//! allocate the anchors, chain each into the list at the width in effect
//! for that order (which deterministically splits the existing buckets
//! by the newly revealed hash bit), then publish the larger width.
//! Shrinking runs the same dance backwards: publish the smaller width
//! first, wait a grace period so no reader still anchors a walk at the
//! doomed level, logically remove and GC its anchors, and free the level
//! array one more grace period later.
//!
//! Resizes serialize on the resize mutex. Inline operations never
//! resize; the split counter and chain heuristic only raise
//! `resize_target` and push a callback through the grace worker, so add
//! and del stay lock-free.

use std::ptr;
use std::sync::atomic::Ordering;

use log::debug;

use splitmap_sync::GraceSync;

use crate::bits;
use crate::config::{
    TableFlags, MAX_TABLE_SIZE, MIN_PARTITION_PER_THREAD, MIN_PARTITION_PER_THREAD_ORDER,
    MIN_TABLE_SIZE,
};
use crate::list::AddMode;
use crate::node::Node;
use crate::table::{alloc_level, free_level, order_len, Table};

/// Sends the table pointer into the deferred resize callback. The
/// `in_progress_resize` counter keeps the table alive until the callback
/// has fully run.
struct TablePtr<S: GraceSync>(*const Table<S>);
unsafe impl<S: GraceSync> Send for TablePtr<S> {}

impl<S: GraceSync> Table<S> {
    /// Chains one partition of a level's anchors into the list.
    fn populate_partition(&self, order: usize, start: usize, len: usize) {
        debug_assert!(order > 0 || (start == 0 && len == 1));
        let level = self.tbl[order].load(Ordering::Acquire);
        let size_at_order = if order == 0 { 0 } else { 1 << (order - 1) };
        debug!(
            "populate order {}: entries {}..{}",
            order,
            start,
            start + len
        );
        // Inside a read critical section: the anchors we traverse past
        // must not be reclaimed under us by concurrent removers.
        self.sync.read_lock();
        for j in start..start + len {
            let node = unsafe { &*level.add(j) };
            unsafe { self.add_node(size_at_order, node, AddMode::Default, true) };
        }
        self.sync.read_unlock();
    }

    /// Logically removes and GCs one partition of a level's anchors.
    fn teardown_partition(&self, order: usize, start: usize, len: usize) {
        debug_assert!(order > 0);
        let level = self.tbl[order].load(Ordering::Acquire);
        let size_at_order = 1 << (order - 1);
        debug!(
            "teardown order {}: entries {}..{}",
            order,
            start,
            start + len
        );
        self.sync.read_lock();
        for j in start..start + len {
            let node = unsafe { &*level.add(j) };
            // Concurrent add/del helpers may beat us to the unlink.
            let _ = self.del_node(size_at_order, node, true);
        }
        self.sync.read_unlock();
    }

    /// Runs `update` over a level, fanned out across scoped workers when
    /// the span is worth it. Workers register with the grace domain for
    /// their lifetime.
    fn partition_update(
        &self,
        order: usize,
        len: usize,
        update: &(dyn Fn(&Self, usize, usize, usize) + Sync),
    ) {
        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if ncpus < 2 || len < 2 * MIN_PARTITION_PER_THREAD {
            self.sync.thread_online();
            update(self, order, 0, len);
            self.sync.thread_offline();
            return;
        }
        // Both operands are powers of two, so the partitioning is exact.
        let nr_threads = ncpus
            .next_power_of_two()
            .min(len >> MIN_PARTITION_PER_THREAD_ORDER);
        let partition_len = len >> bits::count_order(nr_threads).expect("at least one worker");
        std::thread::scope(|scope| {
            for thread in 0..nr_threads {
                let start = thread * partition_len;
                scope.spawn(move || {
                    self.sync.register_thread();
                    update(self, order, start, partition_len);
                    self.sync.unregister_thread();
                });
            }
        });
    }

    /// Installs and populates the level arrays `first_order..first_order
    /// + len_order`, publishing the width after each order.
    pub(crate) fn init_table(&self, first_order: usize, len_order: usize) {
        debug!("init table: orders {}..{}", first_order, first_order + len_order);
        let end_order = first_order + len_order;
        for order in first_order..end_order {
            let len = order_len(order);
            let size_at_order = if order == 0 { 1 } else { 1 << order };
            // Stop expanding if the target dropped under us.
            if self.resize_target.load(Ordering::SeqCst) < size_at_order {
                break;
            }
            debug!("init order {} len {}", order, len);
            let level = alloc_level(order);
            self.tbl[order].store(level, Ordering::Release);
            self.partition_update(order, len, &|table: &Self, order, start, len| {
                table.populate_partition(order, start, len)
            });
            // Anchors first, then the width that reveals them.
            self.size.store(size_at_order, Ordering::Release);
            debug!("init new size: {}", size_at_order);
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Retires the level arrays `first_order..first_order + len_order`,
    /// highest first, lowering the width ahead of each teardown.
    pub(crate) fn fini_table(&self, first_order: usize, len_order: usize) {
        debug!("fini table: orders {}..{}", first_order, first_order + len_order);
        debug_assert!(first_order > 0);
        let end_order = first_order + len_order;
        let mut deferred: Option<(*mut Node, usize)> = None;
        for order in (first_order..end_order).rev() {
            let len = order_len(order);
            // Stop shrinking if the target rose under us.
            if self.resize_target.load(Ordering::SeqCst) > 1 << (order - 1) {
                break;
            }
            debug!("fini order {} len {}", order, len);
            self.size.store(1 << (order - 1), Ordering::Release);
            // Every walk anchored at this level must drain before its
            // anchors go away; the same grace period lets us free the
            // level retired one iteration ago.
            self.sync.synchronize();
            if let Some((level, retired_order)) = deferred.take() {
                unsafe { free_level(level, retired_order) };
            }
            self.partition_update(order, len, &|table: &Self, order, start, len| {
                table.teardown_partition(order, start, len)
            });
            deferred = Some((
                self.tbl[order].swap(ptr::null_mut(), Ordering::AcqRel),
                order,
            ));
            debug!("fini new size: {}", 1 << (order - 1));
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
        }
        if let Some((level, retired_order)) = deferred.take() {
            self.sync.synchronize();
            unsafe { free_level(level, retired_order) };
        }
    }

    fn grow(&self, old_size: usize, new_size: usize) {
        debug_assert!(new_size > old_size);
        let old_order = bits::count_order(old_size).expect("non-zero size") as usize + 1;
        let new_order = bits::count_order(new_size).expect("non-zero size") as usize + 1;
        debug!(
            "grow from {} (order {}) to {} (order {}) buckets",
            old_size, old_order, new_size, new_order
        );
        self.init_table(old_order, new_order - old_order);
    }

    fn shrink(&self, old_size: usize, new_size: usize) {
        let new_size = new_size.max(MIN_TABLE_SIZE);
        debug_assert!(new_size < old_size);
        let old_order = bits::count_order(old_size).expect("non-zero size") as usize + 1;
        let new_order = bits::count_order(new_size).expect("non-zero size") as usize + 1;
        debug!(
            "shrink from {} (order {}) to {} (order {}) buckets",
            old_size, old_order, new_size, new_order
        );
        self.fini_table(new_order, old_order - new_order);
    }

    /// Resize loop; caller holds the resize mutex. Re-reads the target
    /// until it is stable so coalesced requests fuse into one pass.
    pub(crate) fn do_resize(&self) {
        debug_assert!(self.in_progress_resize.load(Ordering::SeqCst) > 0);
        loop {
            if self.in_progress_destroy.load(Ordering::SeqCst) {
                break;
            }
            self.resize_initiated.store(true, Ordering::SeqCst);
            let old_size = self.size.load(Ordering::Acquire);
            let new_size = self.resize_target.load(Ordering::SeqCst);
            if old_size < new_size {
                self.grow(old_size, new_size);
            } else if old_size > new_size {
                self.shrink(old_size, new_size);
            }
            self.resize_initiated.store(false, Ordering::SeqCst);
            if self.size.load(Ordering::Acquire) == self.resize_target.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Blocking resize to `new_size` (rounded up to a power of two,
    /// floored at the minimum width).
    ///
    /// Must not be called from inside a read critical section: shrinking
    /// waits for grace periods.
    pub fn resize(&self, new_size: usize) {
        self.resize_target_update_count(new_size);
        self.resize_initiated.store(true, Ordering::SeqCst);
        self.in_progress_resize.fetch_add(1, Ordering::SeqCst);
        self.sync.thread_offline();
        {
            let _lock = self.resize_mutex.lock();
            self.do_resize();
        }
        self.sync.thread_online();
        self.in_progress_resize.fetch_sub(1, Ordering::SeqCst);
    }

    /// Raises the target to at least `size << growth`, saturating at the
    /// maximum width; returns the resulting target.
    fn resize_target_grow(&self, size: usize, growth: u32) -> usize {
        let target = if growth >= usize::BITS || size > MAX_TABLE_SIZE >> growth {
            MAX_TABLE_SIZE
        } else {
            size << growth
        };
        self.resize_target
            .fetch_max(target, Ordering::SeqCst)
            .max(target)
    }

    /// Points the target at a population-derived width.
    fn resize_target_update_count(&self, count: usize) {
        let count = count.clamp(MIN_TABLE_SIZE, MAX_TABLE_SIZE);
        self.resize_target.store(count, Ordering::SeqCst);
    }

    /// Chain-heuristic entry: grow by `growth` orders, scheduled on the
    /// grace worker unless a resize is already pending.
    pub(crate) fn resize_lazy(&self, size: usize, growth: u32) {
        let target = self.resize_target_grow(size, growth);
        if !self.resize_initiated.load(Ordering::SeqCst) && size < target {
            debug!("scheduling lazy grow: size {} target {}", size, target);
            self.schedule_resize();
        }
    }

    /// Split-counter entry: steer the width toward `count`.
    pub(crate) fn resize_lazy_count(&self, size: usize, count: usize) {
        if !self.config.flags.contains(TableFlags::AUTO_RESIZE) {
            return;
        }
        self.resize_target_update_count(count);
        if !self.resize_initiated.load(Ordering::SeqCst) {
            debug!("scheduling lazy resize: size {} count {}", size, count);
            self.schedule_resize();
        }
    }

    fn schedule_resize(&self) {
        self.in_progress_resize.fetch_add(1, Ordering::SeqCst);
        if self.in_progress_destroy.load(Ordering::SeqCst) {
            self.in_progress_resize.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let table = TablePtr(self as *const Table<S>);
        self.sync.call_after_grace(Box::new(move || {
            // Alive as long as in_progress_resize is held: destroy and
            // drop wait for it to reach zero, and the decrement below is
            // the callback's last touch of the table.
            let table = table;
            let table = unsafe { &*table.0 };
            table.sync.thread_offline();
            {
                let _lock = table.resize_mutex.lock();
                table.do_resize();
            }
            table.sync.thread_online();
            table.in_progress_resize.fetch_sub(1, Ordering::SeqCst);
        }));
        self.resize_initiated.store(true, Ordering::SeqCst);
    }
}
