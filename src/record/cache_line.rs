use atomic::Atomic;

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use super::{thread_bit, AccessKind};
use crate::shadow::MetaPool;
use crate::util::atomics::BoundedAdd;
use crate::util::constants::*;
use crate::util::Address;

/// Per-thread read and write counters for one cache line. Pool-allocated on
/// the line's first recorded access after escalation.
#[repr(C)]
pub struct ThreadAccessCounts {
    reads: [AtomicU32; MAX_THREAD_NUM],
    writes: [AtomicU32; MAX_THREAD_NUM],
}

/// Per-word thread bitmasks for one cache line. Pool-allocated only for
/// partially occupied lines; a line wholly owned by one object can only
/// exhibit true sharing, and per-word resolution would add nothing.
#[repr(C)]
pub struct WordThreadMasks {
    words: [AtomicU64; WORDS_IN_CACHE_LINE],
}

/// The escalated per-cache-line record, created once the enclosing page's
/// write counter for the line crosses the cache sharing threshold. Lives in
/// the fine-grained shadow map until teardown.
///
/// Invalidation accounting: a write by a thread other than the last writer
/// charges one invalidation to the side that lost its cached copy (the
/// previous writer); a repeat read by a thread other than the last writer
/// charges the reading thread, since that read is what forces the
/// remote-to-local transfer. Counting one invalidation per such handover is
/// topology independent, unlike counting per write.
#[repr(C)]
pub struct CacheLineDetail {
    start: Address,
    thread_counts: Atomic<Address>,
    word_threads: Atomic<Address>,
    invalidations_by_first_touch_thread: AtomicU64,
    invalidations_by_other_threads: AtomicU64,
    access_threads: AtomicU64,
    last_writer: AtomicU16,
}

impl CacheLineDetail {
    pub fn new(start: Address) -> Self {
        Self {
            start,
            thread_counts: Atomic::new(Address::ZERO),
            word_threads: Atomic::new(Address::ZERO),
            invalidations_by_first_touch_thread: AtomicU64::new(0),
            invalidations_by_other_threads: AtomicU64::new(0),
            access_threads: AtomicU64::new(0),
            last_writer: AtomicU16::new(THREAD_ID_UNASSIGNED),
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    /// Apply one access to the record.
    pub fn record(
        &self,
        kind: AccessKind,
        thread: u16,
        first_touch_thread: u16,
        word: usize,
        partially_occupied: bool,
        pool: &MetaPool,
        retries: isize,
    ) {
        match kind {
            AccessKind::Write => self.record_write(thread, first_touch_thread, retries),
            AccessKind::Read => self.record_read(thread, first_touch_thread, retries),
        }
        if let Some(counts) = self.thread_counts(pool) {
            let slot = match kind {
                AccessKind::Read => &counts.reads[thread as usize],
                AccessKind::Write => &counts.writes[thread as usize],
            };
            slot.fetch_add_bounded(1, retries);
        }
        if partially_occupied {
            if let Some(masks) = self.word_threads(pool) {
                masks.words[word].fetch_or(thread_bit(thread), Ordering::SeqCst);
            }
        }
    }

    fn record_write(&self, thread: u16, first_touch_thread: u16, retries: isize) {
        let mut prev = self.last_writer.load(Ordering::SeqCst);
        let mut budget = retries;
        while prev != thread {
            match self.last_writer.compare_exchange(
                prev,
                thread,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    // The previous writer just lost its cached copy.
                    if prev != THREAD_ID_UNASSIGNED {
                        self.charge_invalidation(prev, first_touch_thread, retries);
                    }
                    break;
                }
                Err(current) => {
                    if budget == 0 {
                        break;
                    }
                    budget -= 1;
                    prev = current;
                }
            }
        }
        self.access_threads.fetch_or(thread_bit(thread), Ordering::SeqCst);
    }

    fn record_read(&self, thread: u16, first_touch_thread: u16, retries: isize) {
        let bit = thread_bit(thread);
        if self.access_threads.load(Ordering::SeqCst) & bit == 0 {
            // First touch of the line by this thread carries no penalty.
            self.access_threads.fetch_or(bit, Ordering::SeqCst);
            return;
        }
        let last = self.last_writer.load(Ordering::SeqCst);
        if last != thread && last != THREAD_ID_UNASSIGNED {
            // Coherence miss against the last writer, charged to the reader.
            self.charge_invalidation(thread, first_touch_thread, retries);
        }
    }

    fn charge_invalidation(&self, victim: u16, first_touch_thread: u16, retries: isize) {
        if victim == first_touch_thread {
            self.invalidations_by_first_touch_thread.fetch_add_bounded(1, retries);
        } else {
            self.invalidations_by_other_threads.fetch_add_bounded(1, retries);
        }
    }

    fn thread_counts(&self, pool: &MetaPool) -> Option<&ThreadAccessCounts> {
        self.lazy_table::<ThreadAccessCounts>(&self.thread_counts, pool)
    }

    fn word_threads(&self, pool: &MetaPool) -> Option<&WordThreadMasks> {
        self.lazy_table::<WordThreadMasks>(&self.word_threads, pool)
    }

    /// Make sure the per-word bitmasks exist. Called when a line that is
    /// already escalated becomes partially occupied by a later allocation.
    pub fn ensure_word_threads(&self, pool: &MetaPool) {
        let _ = self.word_threads(pool);
    }

    fn lazy_table<T>(&self, slot: &Atomic<Address>, pool: &MetaPool) -> Option<&T> {
        let current = slot.load(Ordering::SeqCst);
        if !current.is_zero() {
            return Some(unsafe { current.as_ref::<T>() });
        }
        let fresh = pool.alloc(std::mem::size_of::<T>(), BYTES_IN_CACHE_LINE)?;
        match slot.compare_exchange(Address::ZERO, fresh, Ordering::SeqCst, Ordering::SeqCst) {
            // The chunk of a losing racer stays unused in the arena.
            Ok(_) => Some(unsafe { fresh.as_ref::<T>() }),
            Err(winner) => Some(unsafe { winner.as_ref::<T>() }),
        }
    }

    pub fn invalidations_by_first_touch_thread(&self) -> u64 {
        self.invalidations_by_first_touch_thread.load(Ordering::SeqCst)
    }

    pub fn invalidations_by_other_threads(&self) -> u64 {
        self.invalidations_by_other_threads.load(Ordering::SeqCst)
    }

    pub fn access_threads(&self) -> u64 {
        self.access_threads.load(Ordering::SeqCst)
    }

    pub fn last_writer(&self) -> u16 {
        self.last_writer.load(Ordering::SeqCst)
    }

    pub fn reads_of(&self, thread: u16) -> u64 {
        match self.loaded_counts() {
            Some(counts) => counts.reads[thread as usize].load(Ordering::SeqCst) as u64,
            None => 0,
        }
    }

    pub fn writes_of(&self, thread: u16) -> u64 {
        match self.loaded_counts() {
            Some(counts) => counts.writes[thread as usize].load(Ordering::SeqCst) as u64,
            None => 0,
        }
    }

    /// The per-word thread bitmasks, if they were ever materialized.
    pub fn word_thread_masks(&self) -> Option<[u64; WORDS_IN_CACHE_LINE]> {
        let table = self.word_threads.load(Ordering::SeqCst);
        if table.is_zero() {
            return None;
        }
        let masks = unsafe { table.as_ref::<WordThreadMasks>() };
        Some(std::array::from_fn(|w| masks.words[w].load(Ordering::SeqCst)))
    }

    fn loaded_counts(&self) -> Option<&ThreadAccessCounts> {
        let table = self.thread_counts.load(Ordering::SeqCst);
        if table.is_zero() {
            return None;
        }
        Some(unsafe { table.as_ref::<ThreadAccessCounts>() })
    }
}
