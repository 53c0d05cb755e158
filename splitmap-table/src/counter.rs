//! Split counter
//!
//! Approximate population tracking: one cache-padded cell per hardware
//! thread (rounded up to a power of two), each with monotone add and del
//! counters. Every `1 << COUNT_COMMIT_ORDER` local operations the delta
//! is folded into a signed global count with one atomic add; resize
//! decisions hang off folds that land the global on a power of two, so
//! the hot path stays a single uncontended increment.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::config::COUNT_COMMIT_ORDER;

const COMMIT_MASK: usize = (1 << COUNT_COMMIT_ORDER) - 1;
const COMMIT_DELTA: isize = 1 << COUNT_COMMIT_ORDER;

/// Stable per-thread shard index. Threads are handed indexes in arrival
/// order; masking by the cell count gives the same statistical spread as
/// a CPU id would.
fn shard_id() -> usize {
    static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
    }
    SHARD.with(|s| *s)
}

#[derive(Default)]
struct CounterCell {
    add: AtomicUsize,
    del: AtomicUsize,
}

pub(crate) struct SplitCounter {
    cells: Box<[CachePadded<CounterCell>]>,
    mask: usize,
    /// Global approximate count, moved in `COMMIT_DELTA` steps.
    count: AtomicIsize,
}

impl SplitCounter {
    pub(crate) fn new() -> SplitCounter {
        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let len = ncpus.next_power_of_two();
        let cells = (0..len)
            .map(|_| CachePadded::new(CounterCell::default()))
            .collect();
        SplitCounter {
            cells,
            mask: len - 1,
            count: AtomicIsize::new(0),
        }
    }

    fn cell(&self) -> &CounterCell {
        &self.cells[shard_id() & self.mask]
    }

    /// Records one insertion. Returns the committed global count when
    /// this increment both folded the local cell and landed the global
    /// on a power of two.
    pub(crate) fn add(&self) -> Option<isize> {
        let local = self.cell().add.fetch_add(1, Ordering::Relaxed) + 1;
        if local & COMMIT_MASK != 0 {
            return None;
        }
        let count = self.count.fetch_add(COMMIT_DELTA, Ordering::Relaxed) + COMMIT_DELTA;
        if count & (count - 1) == 0 {
            Some(count)
        } else {
            None
        }
    }

    /// Records one removal; same fold rule as [`add`](SplitCounter::add).
    pub(crate) fn del(&self) -> Option<isize> {
        let local = self.cell().del.fetch_add(1, Ordering::Relaxed) + 1;
        if local & COMMIT_MASK != 0 {
            return None;
        }
        let count = self.count.fetch_sub(COMMIT_DELTA, Ordering::Relaxed) - COMMIT_DELTA;
        if count & (count - 1) == 0 {
            Some(count)
        } else {
            None
        }
    }

    /// The committed global count, stale by at most one commit window
    /// per cell.
    pub(crate) fn committed(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }

    /// Sums the raw cells. More precise than the committed count but
    /// touches every cell.
    pub(crate) fn approx(&self) -> isize {
        let mut total = 0isize;
        for cell in self.cells.iter() {
            total += cell.add.load(Ordering::Relaxed) as isize;
            total -= cell.del.load(Ordering::Relaxed) as isize;
        }
        total
    }

    pub(crate) fn nr_cells(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_at_commit_threshold() {
        let counter = SplitCounter::new();
        let mut triggered = None;
        for _ in 0..(1 << COUNT_COMMIT_ORDER) {
            if let Some(count) = counter.add() {
                triggered = Some(count);
            }
        }
        // The 1024th increment folds, and 1024 is a power of two.
        assert_eq!(triggered, Some(1 << COUNT_COMMIT_ORDER));
        assert_eq!(counter.committed(), 1 << COUNT_COMMIT_ORDER);
        assert_eq!(counter.approx(), 1 << COUNT_COMMIT_ORDER);
    }

    #[test]
    fn test_approx_tracks_uncommitted_ops() {
        let counter = SplitCounter::new();
        for _ in 0..10 {
            assert_eq!(counter.add(), None);
        }
        for _ in 0..4 {
            assert_eq!(counter.del(), None);
        }
        assert_eq!(counter.committed(), 0);
        assert_eq!(counter.approx(), 6);
    }

    #[test]
    fn test_del_fold() {
        let counter = SplitCounter::new();
        for _ in 0..(2 << COUNT_COMMIT_ORDER) {
            counter.add();
        }
        assert_eq!(counter.committed(), 2 << COUNT_COMMIT_ORDER);
        let mut folded = Vec::new();
        for _ in 0..(1 << COUNT_COMMIT_ORDER) {
            if let Some(count) = counter.del() {
                folded.push(count);
            }
        }
        // 2048 - 1024 = 1024: the del fold lands on a power of two.
        assert_eq!(folded, vec![1 << COUNT_COMMIT_ORDER]);
    }

    #[test]
    fn test_cells_power_of_two() {
        let counter = SplitCounter::new();
        assert!(counter.nr_cells().is_power_of_two());
        assert_eq!(counter.mask, counter.nr_cells() - 1);
    }
}
