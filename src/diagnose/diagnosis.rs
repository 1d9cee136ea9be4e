//! Synthesis of per-object diagnoses when objects are freed.
//!
//! The free hook sweeps the dead object's shadow range: page records gate
//! which pages and cache lines carry escalated detail, the detail records
//! are reduced over the object's extent, and the result is scored and filed
//! into the owning call site's bounded queue. Scores are pure functions of
//! the diagnosis, so the queues have a total order.

use std::cmp::Ordering;

use crate::profiler::NumaSight;
use crate::record::{CacheLineDetail, CallSite, ObjectInfo};
use crate::util::bounded_heap::BoundedHeap;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::Address;

/// Was the sharing on a page caused by the application's own access pattern
/// or by the allocator packing unrelated objects together?
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SharingCause {
    Application,
    Allocator,
}

/// A frozen copy of one escalated cache line record, reduced at free time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLineSummary {
    pub start: Address,
    pub invalidations_by_first_touch_thread: u64,
    pub invalidations_by_other_threads: u64,
    pub reads: u64,
    pub writes: u64,
    pub access_threads: u64,
    pub word_threads: Option<[u64; WORDS_IN_CACHE_LINE]>,
}

impl CacheLineSummary {
    pub fn snapshot(detail: &CacheLineDetail) -> Self {
        let mut reads = 0;
        let mut writes = 0;
        for thread in 0..MAX_THREAD_NUM as u16 {
            reads += detail.reads_of(thread);
            writes += detail.writes_of(thread);
        }
        Self {
            start: detail.start(),
            invalidations_by_first_touch_thread: detail.invalidations_by_first_touch_thread(),
            invalidations_by_other_threads: detail.invalidations_by_other_threads(),
            reads,
            writes,
            access_threads: detail.access_threads(),
            word_threads: detail.word_thread_masks(),
        }
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations_by_first_touch_thread + self.invalidations_by_other_threads
    }

    /// Invalidations weighted by how many threads fight over the line.
    pub fn score(&self) -> u64 {
        self.invalidations() * self.access_threads.count_ones() as u64
    }
}

impl PartialOrd for CacheLineSummary {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheLineSummary {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score()
            .cmp(&other.score())
            .then(self.start.cmp(&other.start))
    }
}

/// Page-level findings for one page an object spanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDiagnosis {
    pub page: Address,
    pub access_threads_in_page: u64,
    pub access_threads_from_object: u64,
    pub page_accesses_by_first_touch_thread: u64,
    pub object_accesses_by_first_touch_thread: u64,
    pub object_accesses_by_other_threads: u64,
    pub cause: SharingCause,
}

impl PageDiagnosis {
    pub fn score(&self) -> u64 {
        let traffic =
            self.object_accesses_by_first_touch_thread + self.object_accesses_by_other_threads;
        traffic * self.access_threads_in_page.count_ones() as u64
    }
}

impl PartialOrd for PageDiagnosis {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PageDiagnosis {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score()
            .cmp(&other.score())
            .then(self.page.cmp(&other.page))
    }
}

/// Everything learned about one object by the time it was freed.
pub struct ObjectDiagnosis {
    pub object: ObjectInfo,
    pub invalidations_in_first_touch_thread: u64,
    pub invalidations_in_other_threads: u64,
    pub accesses_in_first_touch_thread: u64,
    pub accesses_in_other_threads: u64,
    /// Union of the accessing-thread sets over the object's cache lines.
    pub access_threads: u64,
    pub top_cache_lines: BoundedHeap<CacheLineSummary>,
    pub top_pages: BoundedHeap<PageDiagnosis>,
}

impl ObjectDiagnosis {
    pub fn new(object: ObjectInfo, top_k: usize) -> Self {
        Self {
            object,
            invalidations_in_first_touch_thread: 0,
            invalidations_in_other_threads: 0,
            accesses_in_first_touch_thread: 0,
            accesses_in_other_threads: 0,
            access_threads: 0,
            top_cache_lines: BoundedHeap::new(top_k),
            top_pages: BoundedHeap::new(top_k),
        }
    }

    /// Fold a cache line into the totals. The totals take every line; the
    /// queue keeps only the top-K.
    pub fn insert_cache_line(&mut self, summary: CacheLineSummary) {
        self.invalidations_in_first_touch_thread += summary.invalidations_by_first_touch_thread;
        self.invalidations_in_other_threads += summary.invalidations_by_other_threads;
        self.access_threads |= summary.access_threads;
        self.top_cache_lines.insert(summary);
    }

    pub fn insert_page(&mut self, page: PageDiagnosis) {
        self.access_threads |= page.access_threads_from_object;
        self.top_pages.insert(page);
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations_in_first_touch_thread + self.invalidations_in_other_threads
    }

    /// Total invalidations weighted by the number of distinct threads
    /// involved with the object's memory.
    pub fn score(&self) -> u64 {
        self.invalidations() * self.access_threads.count_ones() as u64
    }
}

impl PartialEq for ObjectDiagnosis {
    fn eq(&self, other: &Self) -> bool {
        self.score() == other.score() && self.object.start == other.object.start
    }
}

impl Eq for ObjectDiagnosis {}

impl PartialOrd for ObjectDiagnosis {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectDiagnosis {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score()
            .cmp(&other.score())
            .then(self.object.start.cmp(&other.object.start))
    }
}

/// The process-wide aggregate for one allocation site.
pub struct CallSiteDiagnosis {
    call_site: CallSite,
    objects_diagnosed: u64,
    top_objects: BoundedHeap<ObjectDiagnosis>,
}

impl CallSiteDiagnosis {
    pub fn new(call_site: CallSite, top_k: usize) -> Self {
        Self {
            call_site,
            objects_diagnosed: 0,
            top_objects: BoundedHeap::new(top_k),
        }
    }

    pub fn call_site(&self) -> CallSite {
        self.call_site
    }

    pub fn insert(&mut self, diagnosis: ObjectDiagnosis) {
        self.objects_diagnosed += 1;
        self.top_objects.insert(diagnosis);
    }

    pub fn objects_diagnosed(&self) -> u64 {
        self.objects_diagnosed
    }

    /// The kept objects, worst first.
    pub fn top_objects(&self) -> Vec<&ObjectDiagnosis> {
        self.top_objects.sorted()
    }

    pub fn best_score(&self) -> u64 {
        self.top_objects.iter().map(|o| o.score()).max().unwrap_or(0)
    }
}

/// Sweep the freed object's shadow range into a diagnosis.
pub fn diagnose_object(engine: &NumaSight, info: ObjectInfo) -> ObjectDiagnosis {
    let top_k = *engine.options().top_k;
    let ratio = *engine.options().allocator_share_ratio as u64;
    let mut diagnosis = ObjectDiagnosis::new(info, top_k);

    let mut page_start = conversions::page_align_down(info.start);
    while page_start < info.end() {
        let page_end = page_start + BYTES_IN_PAGE;
        if let Some(page) = engine.page_map().find(page_start) {
            let lo = std::cmp::max(info.start, page_start);
            let hi = std::cmp::min(info.end(), page_end);
            let line_lo = conversions::cache_line_index_in_page(lo);
            let line_hi = conversions::cache_line_index_in_page(hi - 1usize);

            if page.needs_page_sharing_detail(engine.page_sharing_threshold()) {
                if let Some(detail) = engine.page_detail_map().find(page_start) {
                    let own = detail.accesses_in_lines(line_lo..=line_hi);
                    // The total and by-first-touch counters drop updates
                    // independently under contention, so the difference may
                    // transiently run negative.
                    let own_by_others = own.total.saturating_sub(own.by_first_touch_thread);
                    diagnosis.accesses_in_first_touch_thread += own.by_first_touch_thread;
                    diagnosis.accesses_in_other_threads += own_by_others;

                    if info.spans_multiple_cache_lines() {
                        let page_by_first_touch = detail.accesses_by_first_touch_thread();
                        let in_page = detail.access_threads();
                        // The page's first-touch thread was pinned there by
                        // some other object when its page-wide traffic dwarfs
                        // what it did to this object, or when threads share
                        // the page without ever touching this object's bytes.
                        let cause = if page_by_first_touch
                            > ratio.saturating_mul(own.by_first_touch_thread)
                            || own.threads != in_page
                        {
                            SharingCause::Allocator
                        } else {
                            SharingCause::Application
                        };
                        diagnosis.insert_page(PageDiagnosis {
                            page: page_start,
                            access_threads_in_page: in_page,
                            access_threads_from_object: own.threads,
                            page_accesses_by_first_touch_thread: page_by_first_touch,
                            object_accesses_by_first_touch_thread: own.by_first_touch_thread,
                            object_accesses_by_other_threads: own_by_others,
                            cause,
                        });
                    }
                }
            }

            for line in line_lo..=line_hi {
                if page.needs_cache_line_detail(line, engine.cache_sharing_threshold()) {
                    let line_addr = page_start + (line << LOG_BYTES_IN_CACHE_LINE);
                    if let Some(detail) = engine.cache_line_map().find(line_addr) {
                        diagnosis.insert_cache_line(CacheLineSummary::snapshot(detail));
                    }
                }
            }
        }
        page_start = page_end;
    }
    diagnosis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::NumaSight;
    use crate::record::AccessKind;
    use crate::util::options::Options;
    use crate::util::test_util::serial_test;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn totals_accumulate_across_lines() {
        let mut diagnosis = ObjectDiagnosis::new(ObjectInfo::new(addr(0x1000), 128, 1), 4);
        diagnosis.insert_cache_line(CacheLineSummary {
            start: addr(0x1000),
            invalidations_by_first_touch_thread: 3,
            invalidations_by_other_threads: 5,
            reads: 10,
            writes: 20,
            access_threads: 0b11,
            word_threads: None,
        });
        diagnosis.insert_cache_line(CacheLineSummary {
            start: addr(0x1040),
            invalidations_by_first_touch_thread: 1,
            invalidations_by_other_threads: 0,
            reads: 2,
            writes: 2,
            access_threads: 0b100,
            word_threads: None,
        });
        assert_eq!(diagnosis.invalidations_in_first_touch_thread, 4);
        assert_eq!(diagnosis.invalidations_in_other_threads, 5);
        assert_eq!(diagnosis.access_threads, 0b111);
        assert_eq!(diagnosis.score(), 9 * 3);
    }

    #[test]
    fn totals_survive_queue_displacement() {
        let mut diagnosis = ObjectDiagnosis::new(ObjectInfo::new(addr(0x1000), 256, 1), 1);
        for i in 0..4u64 {
            diagnosis.insert_cache_line(CacheLineSummary {
                start: addr(0x1000 + i as usize * 64),
                invalidations_by_first_touch_thread: i,
                invalidations_by_other_threads: 0,
                reads: 0,
                writes: 1,
                access_threads: 0b1,
                word_threads: None,
            });
        }
        // Queue kept only the worst line, totals kept everything.
        assert_eq!(diagnosis.top_cache_lines.len(), 1);
        assert_eq!(diagnosis.invalidations_in_first_touch_thread, 6);
    }

    #[test]
    fn call_site_counts_all_objects() {
        let mut site = CallSiteDiagnosis::new(7, 2);
        for i in 0..5 {
            let mut d = ObjectDiagnosis::new(ObjectInfo::new(addr(0x1000 * (i + 1)), 64, 7), 2);
            d.invalidations_in_other_threads = i as u64;
            d.access_threads = 0b1;
            site.insert(d);
        }
        assert_eq!(site.objects_diagnosed(), 5);
        assert_eq!(site.top_objects().len(), 2);
        // Worst first.
        assert_eq!(site.top_objects()[0].invalidations(), 4);
        assert_eq!(site.best_score(), 4);
    }

    #[test]
    fn scores_order_objects() {
        let mut low = ObjectDiagnosis::new(ObjectInfo::new(addr(0x1000), 64, 1), 2);
        low.invalidations_in_other_threads = 10;
        low.access_threads = 0b1;
        let mut high = ObjectDiagnosis::new(ObjectInfo::new(addr(0x2000), 64, 1), 2);
        high.invalidations_in_other_threads = 10;
        high.access_threads = 0b1111;
        assert!(high > low);
    }

    #[test]
    fn sweep_single_thread_object_scores_zero() {
        serial_test(|| {
            let engine = NumaSight::new(Options::default());
            engine.register_thread();
            let base = addr(0x900_0000);
            engine.on_malloc(base, 64, 3);
            for _ in 0..100 {
                engine.on_access(base, AccessKind::Write);
                engine.on_access(base + 8usize, AccessKind::Read);
            }
            // The line escalated (write count above threshold) but a single
            // writer never invalidates anything.
            assert!(engine.cache_line_map().find(base).is_some());
            let diagnosis = diagnose_object(&engine, ObjectInfo::new(base, 64, 3));
            assert_eq!(diagnosis.invalidations(), 0);
            assert_eq!(diagnosis.score(), 0);
            // No cross-thread page traffic either.
            assert!(diagnosis.top_pages.is_empty());
            assert_eq!(diagnosis.accesses_in_first_touch_thread, 0);
        })
    }

    #[test]
    fn sweep_is_bounded_to_the_object_extent() {
        serial_test(|| {
            let engine = NumaSight::new(Options::default());
            engine.register_thread();
            let mine = addr(0xa00_0000);
            let neighbour = addr(0xa00_0040);
            engine.on_malloc(mine, 64, 4);
            engine.on_malloc(neighbour, 64, 5);
            for _ in 0..50 {
                engine.on_access(mine, AccessKind::Write);
                engine.on_access(neighbour, AccessKind::Write);
            }
            let diagnosis = diagnose_object(&engine, ObjectInfo::new(mine, 64, 4));
            // Only the object's own line is swept.
            for line in diagnosis.top_cache_lines.iter() {
                assert_eq!(line.start, mine);
            }
        })
    }
}
