//! The public table
//!
//! A [`Table`] is a lock-free, resizable hash table over a single
//! split-ordered list. Readers walk the list inside a read critical
//! section of the grace-period primitive and never block writers;
//! writers mutate with CAS only. The bucket index is a per-order vector
//! of immutable level arrays holding the dummy anchor nodes; growing the
//! table just reveals anchors that are already chained into the list.
//!
//! # Thread Safety
//!
//! Every operation is safe to call from any thread. Lookups, inserts and
//! removals are lock-free; [`Table::resize`] blocks on the resize mutex
//! and on grace periods while shrinking.
//!
//! # Memory Management
//!
//! The table owns user node allocations. Removed and replaced nodes are
//! retired through the grace-period primitive, so a reference obtained
//! under a [`ReadGuard`] stays valid until the guard drops.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use splitmap_core::{Error, Key, Result, Value};
use splitmap_sync::{EpochSync, GraceSync};

use crate::bits;
use crate::config::{
    TableConfig, TableFlags, CHAIN_LEN_RESIZE_THRESHOLD, CHAIN_LEN_TARGET, COUNT_COMMIT_ORDER,
    MAX_TABLE_ORDER, MIN_TABLE_SIZE,
};
use crate::counter::SplitCounter;
use crate::node::{Link, Node};

/// Number of anchors in the level array of `order`.
pub(crate) fn order_len(order: usize) -> usize {
    if order == 0 {
        1
    } else {
        1 << (order - 1)
    }
}

/// Allocates the level array of `order`, anchors preset with the
/// reversed hash of the bucket index they will reveal.
pub(crate) fn alloc_level(order: usize) -> *mut Node {
    let len = order_len(order);
    let mut nodes = Vec::with_capacity(len);
    for j in 0..len {
        let index = if order == 0 { 0 } else { (1 << (order - 1)) + j };
        nodes.push(Node::dummy(bits::bit_reverse(index)));
    }
    Box::into_raw(nodes.into_boxed_slice()) as *mut Node
}

/// # Safety
///
/// `level` must come from [`alloc_level`] with the same `order`, be
/// unreachable from the list, and a grace period must have elapsed since
/// its anchors were unlinked.
pub(crate) unsafe fn free_level(level: *mut Node, order: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
        level,
        order_len(order),
    )));
}

/// Sends a retired node pointer into a deferred callback.
struct Retired(*mut Node);
unsafe impl Send for Retired {}

/// A lock-free, resizable concurrent hash table.
///
/// All state hangs off the handle; dropping it reclaims every node. The
/// type parameter selects the grace-period backend, [`EpochSync`] by
/// default.
pub struct Table<S: GraceSync = EpochSync> {
    /// Published table width, always a power of two.
    pub(crate) size: AtomicUsize,
    /// Pending desired width; a monotone max during grow bursts.
    pub(crate) resize_target: AtomicUsize,
    /// Suppresses duplicate lazy-resize scheduling.
    pub(crate) resize_initiated: AtomicBool,
    /// Level arrays indexed by bucket order. Slots are written only under
    /// the resize mutex; the arrays themselves are immutable once
    /// populated.
    pub(crate) tbl: [AtomicPtr<Node>; MAX_TABLE_ORDER],
    pub(crate) config: TableConfig,
    /// Serializes grow and shrink. Holders must be outside any read
    /// critical section: shrinking synchronizes on the grace primitive.
    pub(crate) resize_mutex: Mutex<()>,
    pub(crate) in_progress_resize: AtomicUsize,
    pub(crate) in_progress_destroy: AtomicBool,
    pub(crate) counter: SplitCounter,
    pub(crate) sync: Arc<S>,
}

unsafe impl<S: GraceSync> Send for Table<S> {}
unsafe impl<S: GraceSync> Sync for Table<S> {}

/// An open read critical section.
///
/// References into the table handed out against this guard stay valid
/// until it drops.
pub struct ReadGuard<'a, S: GraceSync> {
    pub(crate) sync: &'a S,
}

impl<S: GraceSync> Drop for ReadGuard<'_, S> {
    fn drop(&mut self) {
        self.sync.read_unlock();
    }
}

/// A lookup or traversal position: the matched node plus the successor
/// word observed at match time (replace and delete need both).
pub struct Iter<'g> {
    pub(crate) node: *const Node,
    pub(crate) next: Link,
    pub(crate) _guard: PhantomData<&'g Node>,
}

impl<'g> Iter<'g> {
    pub(crate) fn empty() -> Iter<'g> {
        Iter {
            node: ptr::null(),
            next: Link::END,
            _guard: PhantomData,
        }
    }

    /// The matched node, or `None` when the walk found nothing.
    pub fn node(&self) -> Option<&'g Node> {
        unsafe { self.node.as_ref() }
    }
}

/// Result of [`Table::add_unique`].
pub enum AddOutcome<'g> {
    /// The key was absent; the new node is in the table.
    Added(&'g Node),
    /// The key was present; nothing changed.
    Exists(&'g Node),
}

impl<'g> AddOutcome<'g> {
    /// The node now carrying the key, whichever way it got there.
    pub fn node(&self) -> &'g Node {
        match self {
            AddOutcome::Added(node) | AddOutcome::Exists(node) => node,
        }
    }

    pub fn was_added(&self) -> bool {
        matches!(self, AddOutcome::Added(_))
    }
}

/// Snapshot returned by [`Table::count_nodes`].
#[derive(Debug, Clone, Copy)]
pub struct NodeCount {
    /// Split-counter estimate taken before the walk.
    pub approx_before: isize,
    /// User nodes found by the walk.
    pub count: usize,
    /// Logically removed nodes still chained at walk time.
    pub removed: usize,
    /// Split-counter estimate taken after the walk.
    pub approx_after: isize,
}

impl Table<EpochSync> {
    /// Creates a table owning its own epoch-based synchronization domain.
    pub fn with_default_sync(config: TableConfig) -> Result<Table<EpochSync>> {
        Table::new(config, Arc::new(EpochSync::new()))
    }
}

impl<S: GraceSync> Table<S> {
    /// Creates a table.
    ///
    /// `config.init_size` must be zero (treated as the minimum) or a
    /// power of two; anything else is rejected with
    /// [`Error::InvalidArgument`].
    pub fn new(config: TableConfig, sync: Arc<S>) -> Result<Table<S>> {
        if config.init_size != 0 && !config.init_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "init_size {} is not a power of two",
                config.init_size
            )));
        }
        let init_size = config.init_size.max(MIN_TABLE_SIZE);
        let table = Table {
            size: AtomicUsize::new(0),
            resize_target: AtomicUsize::new(0),
            resize_initiated: AtomicBool::new(false),
            tbl: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            config,
            resize_mutex: Mutex::new(()),
            in_progress_resize: AtomicUsize::new(0),
            in_progress_destroy: AtomicBool::new(false),
            counter: SplitCounter::new(),
            sync,
        };
        let order = bits::count_order(init_size).expect("non-zero size") as usize + 1;
        table.sync.thread_offline();
        {
            let _lock = table.resize_mutex.lock();
            table
                .resize_target
                .store(1 << (order - 1), Ordering::SeqCst);
            table.init_table(0, order);
        }
        table.sync.thread_online();
        Ok(table)
    }

    /// Opens a read critical section on the table's grace domain.
    pub fn read_lock(&self) -> ReadGuard<'_, S> {
        self.sync.read_lock();
        ReadGuard { sync: &self.sync }
    }

    /// The published table width.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn check_guard(&self, guard: &ReadGuard<'_, S>) {
        assert!(
            ptr::eq(guard.sync, &*self.sync),
            "read guard belongs to a different synchronization domain"
        );
    }

    /// Maps a hash at width `size` to its anchor dummy.
    pub(crate) fn lookup_bucket(&self, size: usize, hash: usize) -> &Node {
        debug_assert!(size > 0);
        let index = hash & (size - 1);
        let order = bits::fls(index) as usize;
        let level = self.tbl[order].load(Ordering::Acquire);
        debug_assert!(!level.is_null());
        let offset = if order == 0 {
            0
        } else {
            index & ((1 << (order - 1)) - 1)
        };
        unsafe { &*level.add(offset) }
    }

    /// Finds `key`. The returned iterator's node is `None` when absent.
    pub fn lookup<'g>(&self, guard: &'g ReadGuard<'_, S>, key: &[u8]) -> Iter<'g> {
        self.check_guard(guard);
        let hash = (self.config.hash)(key, self.config.seed);
        let reverse_hash = bits::bit_reverse(hash);
        let size = self.size.load(Ordering::Acquire);
        let bucket = self.lookup_bucket(size, hash);
        // The anchor itself can never match; start at its successor.
        let mut node = bucket.next.load(Ordering::Acquire).cleared();
        loop {
            if node.is_end() {
                return Iter::empty();
            }
            let node_ref = unsafe { node.deref() };
            if node_ref.reverse_hash > reverse_hash {
                return Iter::empty();
            }
            let next = node_ref.next.load(Ordering::Acquire);
            if !next.is_removed()
                && !next.is_dummy()
                && node_ref.reverse_hash == reverse_hash
                && (self.config.compare)(node_ref.key(), key)
            {
                return Iter {
                    node: node.ptr(),
                    next,
                    _guard: PhantomData,
                };
            }
            node = next.cleared();
        }
    }

    /// Advances `iter` to the next node carrying the same key, or to an
    /// empty position when there is none.
    pub fn next_duplicate<'g>(&self, guard: &'g ReadGuard<'_, S>, iter: &mut Iter<'g>) {
        self.check_guard(guard);
        let Some(current) = iter.node() else {
            return;
        };
        let reverse_hash = current.reverse_hash;
        let key = current.key();
        let mut node = iter.next.cleared();
        loop {
            if node.is_end() {
                *iter = Iter::empty();
                return;
            }
            let node_ref = unsafe { node.deref() };
            if node_ref.reverse_hash > reverse_hash {
                *iter = Iter::empty();
                return;
            }
            let next = node_ref.next.load(Ordering::Acquire);
            if !next.is_removed() && !next.is_dummy() && (self.config.compare)(node_ref.key(), key)
            {
                iter.node = node.ptr();
                iter.next = next;
                return;
            }
            node = next.cleared();
        }
    }

    /// Positions `iter` at the first user node in list order.
    pub fn first<'g>(&self, guard: &'g ReadGuard<'_, S>) -> Iter<'g> {
        self.check_guard(guard);
        let head = unsafe { &*self.tbl[0].load(Ordering::Acquire) };
        let mut iter = Iter {
            node: ptr::null(),
            next: head.next.load(Ordering::Acquire),
            _guard: PhantomData,
        };
        self.advance(&mut iter);
        iter
    }

    /// Advances `iter` to the next user node in list order, skipping
    /// anchors and logically removed nodes.
    pub fn next<'g>(&self, guard: &'g ReadGuard<'_, S>, iter: &mut Iter<'g>) {
        self.check_guard(guard);
        self.advance(iter);
    }

    fn advance(&self, iter: &mut Iter<'_>) {
        let mut node = iter.next.cleared();
        loop {
            if node.is_end() {
                *iter = Iter::empty();
                return;
            }
            let node_ref = unsafe { node.deref() };
            let next = node_ref.next.load(Ordering::Acquire);
            if !next.is_removed() && !next.is_dummy() {
                iter.node = node.ptr();
                iter.next = next;
                return;
            }
            node = next.cleared();
        }
    }

    /// Allocates a user node with its reverse hash set, ready to link.
    fn new_node(&self, key: Key, value: Value) -> *mut Node {
        let hash = (self.config.hash)(&key, self.config.seed);
        let mut node = Box::new(Node::new(key, value));
        node.reverse_hash = bits::bit_reverse(hash);
        Box::into_raw(node)
    }

    /// Schedules a node owned by the table for reclamation after a grace
    /// period.
    pub(crate) fn retire_node(&self, node: *const Node) {
        let retired = Retired(node as *mut Node);
        self.sync.call_after_grace(Box::new(move || {
            let retired = retired;
            drop(unsafe { Box::from_raw(retired.0) });
        }));
    }

    /// Inserts unconditionally; duplicate keys are allowed.
    pub fn add(&self, guard: &ReadGuard<'_, S>, key: Key, value: Value) {
        self.check_guard(guard);
        let node = self.new_node(key, value);
        let size = self.size.load(Ordering::Acquire);
        unsafe { self.add_node(size, &*node, crate::list::AddMode::Default, false) };
        self.count_add(size);
    }

    /// Inserts unless the key is already present.
    pub fn add_unique<'g>(
        &self,
        guard: &'g ReadGuard<'_, S>,
        key: Key,
        value: Value,
    ) -> AddOutcome<'g> {
        self.check_guard(guard);
        let node = self.new_node(key, value);
        let size = self.size.load(Ordering::Acquire);
        let ret = unsafe { self.add_node(size, &*node, crate::list::AddMode::Unique, false) };
        if ptr::eq(ret, node) {
            self.count_add(size);
            AddOutcome::Added(unsafe { &*node })
        } else {
            // Never published; reclaim immediately.
            drop(unsafe { Box::from_raw(node) });
            AddOutcome::Exists(unsafe { &*ret })
        }
    }

    /// Inserts, replacing any node already carrying the key. Returns the
    /// replaced node, valid until the guard drops.
    pub fn add_replace<'g>(
        &self,
        guard: &'g ReadGuard<'_, S>,
        key: Key,
        value: Value,
    ) -> Option<&'g Node> {
        self.check_guard(guard);
        let node = self.new_node(key, value);
        let size = self.size.load(Ordering::Acquire);
        let ret = unsafe { self.add_node(size, &*node, crate::list::AddMode::Replace, false) };
        if ret.is_null() {
            self.count_add(size);
            None
        } else {
            self.retire_node(ret);
            Some(unsafe { &*ret })
        }
    }

    /// Atomically replaces the node `old` points at. Fails with
    /// [`Error::NotFound`] if that node was removed (or replaced) since
    /// the lookup that produced `old`.
    pub fn replace<'g>(
        &self,
        guard: &'g ReadGuard<'_, S>,
        old: &Iter<'g>,
        key: Key,
        value: Value,
    ) -> Result<()> {
        self.check_guard(guard);
        let Some(old_node) = old.node() else {
            return Err(Error::NotFound);
        };
        let node = self.new_node(key, value);
        let size = self.size.load(Ordering::Acquire);
        match unsafe { self.replace_node(size, old_node, old.next, &*node) } {
            Ok(()) => {
                self.retire_node(old_node);
                Ok(())
            }
            Err(err) => {
                // Never published; reclaim immediately.
                drop(unsafe { Box::from_raw(node) });
                Err(err)
            }
        }
    }

    /// Removes the node `iter` points at. Only the caller whose removal
    /// wins reclaims the node; losers get [`Error::NotFound`].
    pub fn del(&self, guard: &ReadGuard<'_, S>, iter: &Iter<'_>) -> Result<()> {
        self.check_guard(guard);
        let Some(node) = iter.node() else {
            return Err(Error::NotFound);
        };
        let size = self.size.load(Ordering::Acquire);
        self.del_node(size, node, false)?;
        self.retire_node(node);
        self.count_del(size);
        Ok(())
    }

    pub(crate) fn count_add(&self, size: usize) {
        if let Some(count) = self.counter.add() {
            if (count >> CHAIN_LEN_RESIZE_THRESHOLD) < size as isize {
                return;
            }
            debug!("count {} triggers grow at size {}", count, size);
            self.resize_lazy_count(size, (count >> (CHAIN_LEN_TARGET - 1)) as usize);
        }
    }

    pub(crate) fn count_del(&self, size: usize) {
        if let Some(count) = self.counter.del() {
            if (count >> CHAIN_LEN_RESIZE_THRESHOLD) >= size as isize {
                return;
            }
            // Keep small tables out of shrink churn.
            if count < ((1 << COUNT_COMMIT_ORDER) * self.counter.nr_cells()) as isize {
                return;
            }
            debug!("count {} triggers shrink at size {}", count, size);
            self.resize_lazy_count(size, (count >> (CHAIN_LEN_TARGET - 1)) as usize);
        }
    }

    /// Chain-length heuristic: grows small tables before the split
    /// counter has committed anything.
    pub(crate) fn check_resize(&self, size: usize, chain_len: u32) {
        if !self.config.flags.contains(TableFlags::AUTO_RESIZE) {
            return;
        }
        if self.counter.committed() >= 1 << COUNT_COMMIT_ORDER {
            return;
        }
        if chain_len > 100 {
            warn!("large chain length: {}", chain_len);
        }
        if chain_len >= CHAIN_LEN_RESIZE_THRESHOLD {
            let growth = bits::count_order((chain_len - (CHAIN_LEN_TARGET - 1)) as usize)
                .expect("chain length above threshold");
            self.resize_lazy(size, growth);
        }
    }

    /// Walks the whole chain and tallies it. Expensive; the split-counter
    /// snapshots on either side bound how much the exact count moved
    /// during the walk.
    pub fn count_nodes(&self, guard: &ReadGuard<'_, S>) -> NodeCount {
        self.check_guard(guard);
        let approx_before = self.counter.approx();
        let mut count = 0;
        let mut removed = 0;
        let mut dummies = 0;
        let head = unsafe { &*self.tbl[0].load(Ordering::Acquire) };
        let mut node: &Node = head;
        loop {
            let next = node.next.load(Ordering::Acquire);
            if next.is_removed() {
                if !next.is_dummy() {
                    removed += 1;
                } else {
                    dummies += 1;
                }
            } else if !next.is_dummy() {
                count += 1;
            } else {
                dummies += 1;
            }
            let succ = next.cleared();
            if succ.is_end() {
                break;
            }
            node = unsafe { succ.deref() };
        }
        debug!("count walk saw {} anchors", dummies);
        NodeCount {
            approx_before,
            count,
            removed,
            approx_after: self.counter.approx(),
        }
    }

    /// Tears the table down.
    ///
    /// Must not race other operations (consuming the handle enforces
    /// that). Waits out in-flight lazy resizes, then verifies only
    /// anchors remain, returning [`Error::NotEmpty`] otherwise. Memory is
    /// reclaimed on drop either way.
    pub fn destroy(self) -> Result<()> {
        self.in_progress_destroy.store(true, Ordering::SeqCst);
        while self.in_progress_resize.load(Ordering::SeqCst) != 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        let head = unsafe { &*self.tbl[0].load(Ordering::Acquire) };
        let mut node: &Node = head;
        loop {
            let next = node.next.load(Ordering::Acquire);
            if !next.is_dummy() {
                return Err(Error::NotEmpty);
            }
            debug_assert!(!next.is_removed());
            let succ = next.cleared();
            if succ.is_end() {
                break;
            }
            node = unsafe { succ.deref() };
        }
        Ok(())
    }
}

impl<S: GraceSync> Drop for Table<S> {
    fn drop(&mut self) {
        // No lazy resize may touch the table once we start freeing.
        self.in_progress_destroy.store(true, Ordering::SeqCst);
        while self.in_progress_resize.load(Ordering::SeqCst) != 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        // Exclusive access: free the user nodes still linked, then the
        // level arrays. Retired nodes are unreachable from the list and
        // are freed by the grace worker.
        let head = self.tbl[0].load(Ordering::Acquire);
        if head.is_null() {
            return;
        }
        let mut link = unsafe { (*head).next.load(Ordering::Acquire) }.cleared();
        while !link.is_end() {
            let node = link.ptr();
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_dummy() {
                drop(unsafe { Box::from_raw(node) });
            }
            link = next.cleared();
        }
        let size = self.size.load(Ordering::Acquire);
        let top = bits::count_order(size).unwrap_or(0) as usize;
        for order in 0..=top {
            let level = self.tbl[order].swap(ptr::null_mut(), Ordering::AcqRel);
            if !level.is_null() {
                unsafe { free_level(level, order) };
            }
        }
    }
}
