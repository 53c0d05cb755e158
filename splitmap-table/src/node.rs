//! Nodes and tagged successor words
//!
//! Every node — bucket anchors included — lives on one singly linked
//! list sorted by bit-reversed hash. A node's `next` field is a single
//! CAS-able word carrying the successor address plus two low-bit flags
//! describing the *owning* node: `REMOVED` marks it logically deleted,
//! `DUMMY` marks it a bucket anchor. Both flags must be re-applied by
//! every CAS that rewrites the word. The end-of-list sentinel is the
//! null address, with or without flags.

use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use splitmap_core::{Key, Value};

bitflags! {
    /// Flags carried in the low bits of a node's `next` word.
    ///
    /// Nodes align to at least a machine word, so the two low address
    /// bits are free.
    pub(crate) struct LinkFlags: usize {
        /// The owning node is logically removed; no node may attach to
        /// it, and bucket GC must unlink it.
        const REMOVED = 0b01;
        /// The owning node is a bucket anchor.
        const DUMMY   = 0b10;
    }
}

const FLAGS_MASK: usize = 0b11;

/// A tagged successor word: node address plus [`LinkFlags`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Link(usize);

impl Link {
    /// End-of-list sentinel.
    pub(crate) const END: Link = Link(0);

    pub(crate) fn to(node: *const Node) -> Link {
        Link(node as usize)
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }

    /// The successor address with the flags stripped.
    pub(crate) fn ptr(self) -> *mut Node {
        (self.0 & !FLAGS_MASK) as *mut Node
    }

    pub(crate) fn is_end(self) -> bool {
        self.ptr().is_null()
    }

    pub(crate) fn is_removed(self) -> bool {
        self.0 & LinkFlags::REMOVED.bits() != 0
    }

    pub(crate) fn is_dummy(self) -> bool {
        self.0 & LinkFlags::DUMMY.bits() != 0
    }

    /// Strips both flags.
    pub(crate) fn cleared(self) -> Link {
        Link(self.0 & !FLAGS_MASK)
    }

    pub(crate) fn removed(self) -> Link {
        Link(self.0 | LinkFlags::REMOVED.bits())
    }

    pub(crate) fn dummy(self) -> Link {
        Link(self.0 | LinkFlags::DUMMY.bits())
    }

    pub(crate) fn dummy_if(self, cond: bool) -> Link {
        if cond {
            self.dummy()
        } else {
            self
        }
    }

    /// # Safety
    ///
    /// The stripped address must point to a node that stays valid for
    /// `'a` (in practice: loaded inside a read critical section, or
    /// reached under the resize mutex / exclusive access).
    pub(crate) unsafe fn deref<'a>(self) -> &'a Node {
        &*self.ptr()
    }
}

/// Atomic wrapper over a [`Link`] word.
pub(crate) struct AtomicLink(AtomicUsize);

impl AtomicLink {
    pub(crate) const fn end() -> AtomicLink {
        AtomicLink(AtomicUsize::new(0))
    }

    pub(crate) fn load(&self, order: Ordering) -> Link {
        Link(self.0.load(order))
    }

    pub(crate) fn store(&self, link: Link, order: Ordering) {
        self.0.store(link.raw(), order)
    }

    /// Release on success, acquire on failure; returns the observed word
    /// on failure.
    pub(crate) fn compare_exchange(&self, current: Link, new: Link) -> Result<Link, Link> {
        self.0
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(Link)
            .map_err(Link)
    }
}

/// A single entry of the split-ordered list.
///
/// User nodes carry a caller key/value. Dummy nodes are bucket anchors
/// allocated inside the index's level arrays; they carry empty key and
/// value and are told apart by the `DUMMY` flag in their own `next`
/// word. `reverse_hash` is immutable once the node is published.
pub struct Node {
    pub(crate) next: AtomicLink,
    pub(crate) reverse_hash: usize,
    key: Key,
    value: Value,
}

// The two flag bits require word alignment.
const _: () = assert!(std::mem::align_of::<Node>() >= 4);

impl Node {
    /// Creates an unlinked user node. The table assigns the reverse hash
    /// when the node is inserted.
    pub(crate) fn new(key: Key, value: Value) -> Node {
        Node {
            next: AtomicLink::end(),
            reverse_hash: 0,
            key,
            value,
        }
    }

    /// Creates a bucket anchor for the given reversed bucket index.
    pub(crate) fn dummy(reverse_hash: usize) -> Node {
        Node {
            next: AtomicLink::end(),
            reverse_hash,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_flag_round_trip() {
        let node = Node::new(b"k".to_vec(), b"v".to_vec());
        let link = Link::to(&node);
        assert!(!link.is_removed());
        assert!(!link.is_dummy());
        assert!(!link.is_end());

        let flagged = link.removed().dummy();
        assert!(flagged.is_removed());
        assert!(flagged.is_dummy());
        assert_eq!(flagged.ptr(), link.ptr());
        assert_eq!(flagged.cleared(), link);
    }

    #[test]
    fn test_end_keeps_flags() {
        // The order-0 anchor terminates the initial list with a flagged
        // end sentinel; the sentinel test must see through the flags.
        let end = Link::END.dummy();
        assert!(end.is_end());
        assert!(end.is_dummy());
        assert!(!end.is_removed());
    }

    #[test]
    fn test_dummy_if() {
        let node = Node::dummy(0);
        let link = Link::to(&node);
        assert!(link.dummy_if(true).is_dummy());
        assert!(!link.dummy_if(false).is_dummy());
    }
}
