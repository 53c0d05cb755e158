//! Split-ordered list mutation
//!
//! One singly linked list threads every anchor and user node in
//! ascending reverse-hash order. Any window between two adjacent anchors
//! holds exactly the keys of one bucket at the current width, so a
//! single list serves every power-of-two width at once.
//!
//! Removal is two-phase. A remover first flags the victim's own `next`
//! word with REMOVED (winning that CAS is what decides ownership), then
//! garbage-collects the bucket: walking from the immortal anchor, every
//! predecessor pointing at a node with a flagged successor is CAS'd past
//! it. Inserters that run into a flagged successor perform the same
//! unlink step before retrying, which keeps the whole structure
//! lock-free even when removers stall. Because the GC walk starts at the
//! anchor and reverse hashes only grow along the chain, a walk that
//! terminates proves the victim is off a chain that is actually linked.

use std::ptr;
use std::sync::atomic::Ordering;

use splitmap_core::{Error, Result};
use splitmap_sync::GraceSync;

use crate::bits;
use crate::node::{Link, Node};
use crate::table::Table;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddMode {
    /// Insert unconditionally; duplicates allowed.
    Default,
    /// Return the pre-existing node untouched on a key match.
    Unique,
    /// Atomically swap the new node in on a key match.
    Replace,
}

impl<S: GraceSync> Table<S> {
    /// Unlinks every logically removed node between the bucket anchor
    /// `dummy` and the reverse-hash position of `node`.
    pub(crate) fn gc_bucket(&self, dummy: &Node, node: &Node) {
        debug_assert!(dummy.reverse_hash <= node.reverse_hash);
        debug_assert!(!ptr::eq(dummy, node));
        loop {
            let mut iter_prev: &Node = dummy;
            // The anchor itself is never removed; skip it.
            let mut iter = iter_prev.next.load(Ordering::Acquire);
            loop {
                if iter.is_end() {
                    return;
                }
                let iter_node = unsafe { iter.deref() };
                if iter_node.reverse_hash > node.reverse_hash {
                    return;
                }
                let next = iter_node.next.load(Ordering::Acquire);
                if next.is_removed() {
                    // Unlink iter_node, keeping iter_prev's own flags
                    // intact in the word we write back.
                    let mut new_next = next.cleared().dummy_if(iter.is_dummy());
                    if iter.is_removed() {
                        new_next = new_next.removed();
                    }
                    let _ = iter_prev.next.compare_exchange(iter, new_next);
                    // Whether we or a helper won, restart from the anchor.
                    break;
                }
                iter_prev = iter_node;
                iter = next;
            }
        }
    }

    /// Core insert at width `size`.
    ///
    /// Returns the node now carrying the key: the inserted node, the
    /// pre-existing one (`Unique`), or the replaced one — null when
    /// `Replace` inserted fresh.
    ///
    /// # Safety
    ///
    /// `node` must be unpublished, with its reverse hash set, and must
    /// stay allocated for the table's lifetime once this returns it as
    /// inserted. Must run inside a read critical section.
    pub(crate) unsafe fn add_node(
        &self,
        size: usize,
        node: &Node,
        mode: AddMode,
        dummy: bool,
    ) -> *const Node {
        debug_assert!(mode == AddMode::Default || !dummy);
        if size == 0 {
            // First add ever: `node` becomes the order-0 anchor heading
            // the whole list.
            debug_assert!(dummy);
            node.next.store(Link::END.dummy(), Ordering::Relaxed);
            return node as *const Node;
        }
        let bucket = self.lookup_bucket(size, bits::bit_reverse(node.reverse_hash));
        'retry: loop {
            let mut chain_len = 0u32;
            let mut iter_prev: &Node = bucket;
            let mut iter = iter_prev.next.load(Ordering::Acquire);
            debug_assert!(iter_prev.reverse_hash <= node.reverse_hash);
            loop {
                if iter.is_end() {
                    break;
                }
                let iter_node = iter.deref();
                if iter_node.reverse_hash > node.reverse_hash {
                    break;
                }
                // An anchor heads its identical-hash chain: a new anchor
                // with this reverse hash slots in right here.
                if dummy && iter_node.reverse_hash == node.reverse_hash {
                    break;
                }
                let next = iter_node.next.load(Ordering::Acquire);
                if next.is_removed() {
                    // Help the remover unlink, then retry the walk.
                    let new_next = next.cleared().dummy_if(iter.is_dummy());
                    let _ = iter_prev.next.compare_exchange(iter, new_next);
                    continue 'retry;
                }
                if mode != AddMode::Default
                    && !next.is_dummy()
                    && iter_node.reverse_hash == node.reverse_hash
                    && (self.config.compare)(node.key(), iter_node.key())
                {
                    match mode {
                        AddMode::Unique => return iter_node as *const Node,
                        AddMode::Replace => {
                            match self.replace_node(size, iter_node, next, node) {
                                Ok(()) => return iter_node as *const Node,
                                Err(_) => continue 'retry,
                            }
                        }
                        AddMode::Default => unreachable!(),
                    }
                }
                // Identical reverse hashes count once; anchors not at all.
                if iter_prev.reverse_hash != iter_node.reverse_hash && !next.is_dummy() {
                    chain_len += 1;
                    self.check_resize(size, chain_len);
                }
                iter_prev = iter_node;
                iter = next;
            }
            // Insert between iter_prev and iter.
            debug_assert!(!iter.is_removed());
            debug_assert!(!ptr::eq(iter.ptr(), node));
            debug_assert!(!ptr::eq(iter_prev, node));
            node.next
                .store(iter.cleared().dummy_if(dummy), Ordering::Relaxed);
            let new_link = Link::to(node).dummy_if(iter.is_dummy());
            if iter_prev.next.compare_exchange(iter, new_link).is_ok() {
                return match mode {
                    AddMode::Replace => ptr::null(),
                    _ => node as *const Node,
                };
            }
            // Lost the race for iter_prev's word; retry from the anchor.
        }
    }

    /// Lock-free replace: splices `new_node` in *after* `old_node` while
    /// flagging `old_node` removed in the same CAS. Readers either still
    /// see the old node or skip straight to the new one; a follow-up GC
    /// unlinks the old node before this returns.
    ///
    /// # Safety
    ///
    /// `new_node` must be unpublished with its reverse hash set;
    /// `old_next` must be a successor word observed on `old_node`. Must
    /// run inside a read critical section.
    pub(crate) unsafe fn replace_node(
        &self,
        size: usize,
        old_node: &Node,
        mut old_next: Link,
        new_node: &Node,
    ) -> Result<()> {
        debug_assert!(!ptr::eq(old_node, new_node));
        debug_assert_eq!(old_node.reverse_hash, new_node.reverse_hash);
        loop {
            if old_next.is_removed() {
                // Removed under us between lookup and replace.
                return Err(Error::NotFound);
            }
            debug_assert!(!old_next.is_dummy());
            debug_assert!(!ptr::eq(old_next.ptr(), new_node));
            new_node.next.store(old_next.cleared(), Ordering::Relaxed);
            match old_node
                .next
                .compare_exchange(old_next, Link::to(new_node).removed())
            {
                Ok(_) => break,
                Err(actual) => old_next = actual,
            }
        }
        // Make the old node unreachable before anyone relies on the new
        // one being the only match.
        let bucket = self.lookup_bucket(size, bits::bit_reverse(old_node.reverse_hash));
        self.gc_bucket(bucket, new_node);
        debug_assert!(old_node.next.load(Ordering::Acquire).is_removed());
        Ok(())
    }

    /// Two-phase removal. Winning the flagging CAS transfers ownership
    /// of the node to the caller; the bucket GC then guarantees the node
    /// is unlinked before any later read critical section can begin.
    pub(crate) fn del_node(&self, size: usize, node: &Node, dummy_removal: bool) -> Result<()> {
        let mut old = node.next.load(Ordering::Acquire);
        loop {
            if old.is_removed() {
                // Someone else won the removal.
                return Err(Error::NotFound);
            }
            debug_assert_eq!(old.is_dummy(), dummy_removal);
            match node.next.compare_exchange(old, old.removed()) {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }
        let bucket = self.lookup_bucket(size, bits::bit_reverse(node.reverse_hash));
        self.gc_bucket(bucket, node);
        debug_assert!(node.next.load(Ordering::Acquire).is_removed());
        Ok(())
    }
}
