use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::thread_bit;
use crate::util::atomics::BoundedAdd;
use crate::util::constants::*;

/// The escalated per-page record, created once a page's access count by
/// non-first-touch threads crosses the page sharing threshold. Tracks, for
/// the whole page and per cache line, who accessed it and how much of the
/// traffic came from the page's first-touch thread. The per-line resolution
/// is what lets the free-time sweep restrict the numbers to one object's
/// extent.
#[repr(C)]
pub struct PageDetail {
    accesses_by_first_touch_thread: AtomicU64,
    access_threads: AtomicU64,
    line_accesses: [AtomicU32; CACHE_LINES_IN_PAGE],
    line_accesses_by_first_touch_thread: [AtomicU32; CACHE_LINES_IN_PAGE],
    line_access_threads: [AtomicU64; CACHE_LINES_IN_PAGE],
}

/// Per-line numbers reduced over a line range (an object's extent within
/// the page).
pub struct RangeAccesses {
    pub total: u64,
    pub by_first_touch_thread: u64,
    pub threads: u64,
}

impl PageDetail {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            accesses_by_first_touch_thread: AtomicU64::new(0),
            access_threads: AtomicU64::new(0),
            line_accesses: std::array::from_fn(|_| AtomicU32::new(0)),
            line_accesses_by_first_touch_thread: std::array::from_fn(|_| AtomicU32::new(0)),
            line_access_threads: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, thread: u16, first_touch_thread: u16, line: usize, retries: isize) {
        debug_assert!(line < CACHE_LINES_IN_PAGE);
        if thread == first_touch_thread {
            self.accesses_by_first_touch_thread.fetch_add_bounded(1, retries);
            self.line_accesses_by_first_touch_thread[line].fetch_add_bounded(1, retries);
        }
        self.access_threads.fetch_or(thread_bit(thread), Ordering::SeqCst);
        self.line_access_threads[line].fetch_or(thread_bit(thread), Ordering::SeqCst);
        self.line_accesses[line].fetch_add_bounded(1, retries);
    }

    /// Page-wide access count by the page's first-touch thread.
    pub fn accesses_by_first_touch_thread(&self) -> u64 {
        self.accesses_by_first_touch_thread.load(Ordering::SeqCst)
    }

    /// All threads that accessed the page since escalation.
    pub fn access_threads(&self) -> u64 {
        self.access_threads.load(Ordering::SeqCst)
    }

    /// Reduce the per-line numbers over `lines`.
    pub fn accesses_in_lines(&self, lines: RangeInclusive<usize>) -> RangeAccesses {
        let mut reduced = RangeAccesses {
            total: 0,
            by_first_touch_thread: 0,
            threads: 0,
        };
        for line in lines {
            debug_assert!(line < CACHE_LINES_IN_PAGE);
            reduced.total += self.line_accesses[line].load(Ordering::SeqCst) as u64;
            reduced.by_first_touch_thread +=
                self.line_accesses_by_first_touch_thread[line].load(Ordering::SeqCst) as u64;
            reduced.threads |= self.line_access_threads[line].load(Ordering::SeqCst);
        }
        reduced
    }
}
