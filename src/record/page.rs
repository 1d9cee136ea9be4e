use std::sync::atomic::{AtomicU64, Ordering};

use super::AccessKind;
use crate::util::atomics::BoundedAdd;
use crate::util::constants::*;

/// The cheap per-page record, updated on every access. Created lazily on the
/// first access to the page, or by the first-touch signal, whichever comes
/// first; the slot tag of the enclosing shadow map makes creation
/// at-most-once, which fixes `first_touch_thread` exactly once. Counters
/// only ever grow. Never destroyed before teardown.
#[repr(C)]
pub struct PageAccessInfo {
    first_touch_thread: u16,
    accesses_by_other_threads: AtomicU64,
    /// One bit per cache line; set when an object boundary falls strictly
    /// inside the line.
    partial_lines: AtomicU64,
    cache_line_writes: [AtomicU64; CACHE_LINES_IN_PAGE],
}

impl PageAccessInfo {
    pub fn new(first_touch_thread: u16) -> Self {
        Self {
            first_touch_thread,
            accesses_by_other_threads: AtomicU64::new(0),
            partial_lines: AtomicU64::new(0),
            cache_line_writes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn first_touch_thread(&self) -> u16 {
        self.first_touch_thread
    }

    /// Count the access towards page sharing if it comes from a thread other
    /// than the first-touch thread.
    pub fn record_access_for_page_sharing(&self, thread: u16, retries: isize) {
        if thread != self.first_touch_thread {
            self.accesses_by_other_threads.fetch_add_bounded(1, retries);
        }
    }

    /// Count a write towards the line's escalation threshold.
    pub fn record_access_for_cache_sharing(&self, kind: AccessKind, line: usize, retries: isize) {
        if kind == AccessKind::Write {
            self.cache_line_writes[line].fetch_add_bounded(1, retries);
        }
    }

    pub fn needs_page_sharing_detail(&self, threshold: usize) -> bool {
        self.accesses_by_other_threads.load(Ordering::SeqCst) > threshold as u64
    }

    pub fn needs_cache_line_detail(&self, line: usize, threshold: usize) -> bool {
        self.cache_line_writes[line].load(Ordering::SeqCst) > threshold as u64
    }

    pub fn accesses_by_other_threads(&self) -> u64 {
        self.accesses_by_other_threads.load(Ordering::SeqCst)
    }

    pub fn cache_line_writes(&self, line: usize) -> u64 {
        self.cache_line_writes[line].load(Ordering::SeqCst)
    }

    pub fn mark_partial_line(&self, line: usize) {
        debug_assert!(line < CACHE_LINES_IN_PAGE);
        self.partial_lines.fetch_or(1u64 << line, Ordering::SeqCst);
    }

    pub fn is_partial_line(&self, line: usize) -> bool {
        debug_assert!(line < CACHE_LINES_IN_PAGE);
        self.partial_lines.load(Ordering::SeqCst) & (1u64 << line) != 0
    }
}
