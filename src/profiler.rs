//! The engine aggregate and the access hot path.
//!
//! One `NumaSight` instance shadows one process. The hooks in [`crate::api`]
//! reach it through a process-wide singleton because the instrumentation
//! contract gives them no handle argument; everything on the instance takes
//! `&self`, so tests build private instances freely.
//!
//! The hot path is constant time: a thread-local id read, one shadow lookup
//! (plus an at-most-once lazy insert), a handful of sequentially consistent
//! atomics, and two threshold checks that gate the escalated records. The
//! only lock in sight is the fragment-creation lock on the shadow map cold
//! path.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;

use spin::Mutex;

use crate::diagnose::diagnosis::{diagnose_object, CallSiteDiagnosis};
use crate::record::{
    AccessKind, CacheLineDetail, CallSite, ObjectInfo, PageAccessInfo, PageDetail,
};
use crate::registry::ObjectRegistry;
use crate::shadow::{MetaPool, ShadowMap, SingleFragShadowMap};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::options::Options;
use crate::util::Address;

/// Virtual span of the side-table arena.
const META_POOL_BYTES: usize = 1 << 34;

lazy_static! {
    static ref ENGINE: NumaSight = NumaSight::new(Options::default());
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Process-wide dense thread id allocation. The ids index the per-thread
/// tables, so they must stay small; the OS thread id is 64-bit and sparse.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<u16> = const { Cell::new(THREAD_ID_UNASSIGNED) };
}

/// The dense id of the calling thread, if it went through the thread-start
/// hook. `None` also while the thread is being torn down.
pub fn current_thread_id() -> Option<u16> {
    THREAD_ID
        .try_with(|slot| slot.get())
        .ok()
        .filter(|id| *id != THREAD_ID_UNASSIGNED)
}

/// Force the engine into existence and open the hook gate.
pub fn initialize() {
    let _ = crate::util::logger::init();
    lazy_static::initialize(&ENGINE);
    INITIALIZED.store(true, Ordering::SeqCst);
    info!("numasight engine initialized");
}

/// Are the hooks live? Calls made before initialization (for example during
/// dynamic-loader setup) are dropped by the callers of this.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

pub fn singleton() -> &'static NumaSight {
    &ENGINE
}

pub struct NumaSight {
    options: Options,
    // Threshold copies so the hot path never chases the options struct.
    page_sharing_threshold: usize,
    cache_sharing_threshold: usize,
    counter_retries: isize,
    max_threads: usize,
    page_map: SingleFragShadowMap<PageAccessInfo>,
    page_detail_map: ShadowMap<PageDetail>,
    cache_line_map: ShadowMap<CacheLineDetail>,
    pool: MetaPool,
    registry: ObjectRegistry,
    call_sites: Mutex<HashMap<CallSite, CallSiteDiagnosis>>,
    thread_overflow: Once,
}

impl NumaSight {
    pub fn new(options: Options) -> Self {
        let page_sharing_threshold = *options.page_sharing_threshold;
        let cache_sharing_threshold = *options.cache_sharing_threshold;
        let counter_retries = *options.counter_retries;
        let max_threads = *options.max_threads;
        Self {
            options,
            page_sharing_threshold,
            cache_sharing_threshold,
            counter_retries,
            max_threads,
            page_map: SingleFragShadowMap::new("page", false),
            page_detail_map: ShadowMap::new("page_detail", LOG_BYTES_IN_PAGE, true),
            cache_line_map: ShadowMap::new("cache_line", LOG_BYTES_IN_CACHE_LINE, true),
            pool: MetaPool::new("side_tables", META_POOL_BYTES),
            registry: ObjectRegistry::new(),
            call_sites: Mutex::new(HashMap::new()),
            thread_overflow: Once::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn page_map(&self) -> &SingleFragShadowMap<PageAccessInfo> {
        &self.page_map
    }

    pub fn page_detail_map(&self) -> &ShadowMap<PageDetail> {
        &self.page_detail_map
    }

    pub fn cache_line_map(&self) -> &ShadowMap<CacheLineDetail> {
        &self.cache_line_map
    }

    pub(crate) fn page_sharing_threshold(&self) -> usize {
        self.page_sharing_threshold
    }

    pub(crate) fn cache_sharing_threshold(&self) -> usize {
        self.cache_sharing_threshold
    }

    /// Assign the calling thread its dense id, or return the one it already
    /// has. Beyond the configured capacity all new threads share the last
    /// id; their attributions collide but the process continues.
    pub fn register_thread(&self) -> u16 {
        THREAD_ID.with(|slot| {
            let existing = slot.get();
            if existing != THREAD_ID_UNASSIGNED {
                return existing;
            }
            let mut id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
            if id >= self.max_threads {
                self.thread_overflow.call_once(|| {
                    warn!(
                        "thread id capacity ({}) exhausted, further threads share id {}",
                        self.max_threads,
                        self.max_threads - 1
                    );
                });
                id = self.max_threads - 1;
            }
            slot.set(id as u16);
            id as u16
        })
    }

    /// The access hot path, called for every load and store of the target.
    pub fn on_access(&self, addr: Address, kind: AccessKind) {
        let thread = match current_thread_id() {
            Some(t) => t,
            None => return,
        };
        if addr.is_zero() {
            return;
        }
        let page = match self.page_record(addr, thread) {
            Some(p) => p,
            None => return,
        };

        let first_touch = page.first_touch_thread();
        let line = conversions::cache_line_index_in_page(addr);
        page.record_access_for_page_sharing(thread, self.counter_retries);
        page.record_access_for_cache_sharing(kind, line, self.counter_retries);

        if page.needs_page_sharing_detail(self.page_sharing_threshold) {
            if let Some(detail) = self.page_detail(addr) {
                detail.record(thread, first_touch, line, self.counter_retries);
            }
        }

        if page.needs_cache_line_detail(line, self.cache_sharing_threshold) {
            if let Some(detail) = self.cache_line_detail(addr) {
                detail.record(
                    kind,
                    thread,
                    first_touch,
                    conversions::word_index_in_cache_line(addr),
                    page.is_partial_line(line),
                    &self.pool,
                    self.counter_retries,
                );
            }
        }
    }

    /// The page record for `addr`, created with `thread` as first-touch if
    /// this access materializes it.
    fn page_record(&self, addr: Address, thread: u16) -> Option<&PageAccessInfo> {
        if let Some(page) = self.page_map.find(addr) {
            return Some(page);
        }
        self.page_map.insert_if_absent(addr, PageAccessInfo::new(thread));
        self.page_map.find(addr)
    }

    fn page_detail(&self, addr: Address) -> Option<&PageDetail> {
        let key = conversions::page_align_down(addr);
        if let Some(detail) = self.page_detail_map.find(key) {
            return Some(detail);
        }
        self.page_detail_map.insert_if_absent(key, PageDetail::new());
        self.page_detail_map.find(key)
    }

    fn cache_line_detail(&self, addr: Address) -> Option<&CacheLineDetail> {
        let key = conversions::cache_line_align_down(addr);
        if let Some(detail) = self.cache_line_map.find(key) {
            return Some(detail);
        }
        self.cache_line_map.insert_if_absent(key, CacheLineDetail::new(key));
        self.cache_line_map.find(key)
    }

    /// The first-touch signal: fixes the page's first-touch thread if no
    /// access materialized the record yet.
    pub fn on_first_touch(&self, addr: Address, thread: u16) {
        if addr.is_zero() {
            return;
        }
        self.page_map.insert_if_absent(addr, PageAccessInfo::new(thread));
    }

    /// The allocation hook: register the object and mark the cache lines
    /// its boundaries fall into as partially occupied.
    pub fn on_malloc(&self, addr: Address, size: usize, call_site: CallSite) {
        if addr.is_zero() || size == 0 {
            return;
        }
        let info = ObjectInfo::new(addr, size, call_site);
        self.registry.register(info);

        if info.starts_inside_cache_line() {
            self.mark_partial(info.start);
        }
        if info.ends_inside_cache_line() {
            self.mark_partial(info.end() - 1usize);
        }
    }

    fn mark_partial(&self, addr: Address) {
        let page = match current_thread_id() {
            Some(thread) => self.page_record(addr, thread),
            // Without a thread id the page record cannot be created; mark
            // only if an access already materialized it.
            None => self.page_map.find(addr),
        };
        if let Some(page) = page {
            page.mark_partial_line(conversions::cache_line_index_in_page(addr));
        }
        // A line escalated before this allocation needs its word table now.
        if let Some(detail) = self.cache_line_map.find(conversions::cache_line_align_down(addr)) {
            detail.ensure_word_threads(&self.pool);
        }
    }

    /// The free hook: claim the object, sweep its shadow range into a
    /// diagnosis, and file it under the allocation site. A free without a
    /// matching registration (an allocation that predates instrumentation,
    /// or the second of two racing frees) is dropped. The shadow records are
    /// deliberately left in place: a future allocation at the same address
    /// joins the existing history, which biases towards over-attributing
    /// sharing to reused regions.
    pub fn on_free(&self, addr: Address) {
        if addr.is_zero() {
            return;
        }
        let info = match self.registry.unregister(addr) {
            Some(info) => info,
            None => return,
        };
        let diagnosis = diagnose_object(self, info);
        let mut sites = self.call_sites.lock();
        sites
            .entry(info.call_site)
            .or_insert_with(|| CallSiteDiagnosis::new(info.call_site, *self.options.top_k))
            .insert(diagnosis);
    }

    /// Run `f` over the per-call-site diagnosis table.
    pub fn with_call_sites<R>(
        &self,
        f: impl FnOnce(&HashMap<CallSite, CallSiteDiagnosis>) -> R,
    ) -> R {
        let sites = self.call_sites.lock();
        f(&sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::serial_test;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    fn test_engine() -> NumaSight {
        NumaSight::new(Options::default())
    }

    #[test]
    fn accesses_without_thread_id_are_dropped() {
        serial_test(|| {
            // Runs on a thread that never registered: nothing may materialize.
            let engine = test_engine();
            std::thread::scope(|s| {
                s.spawn(|| {
                    engine.on_access(addr(0x1_0000), AccessKind::Write);
                    assert!(engine.page_map().find(addr(0x1_0000)).is_none());
                });
            });
        })
    }

    #[test]
    fn first_access_fixes_first_touch() {
        serial_test(|| {
            let engine = test_engine();
            let me = engine.register_thread();
            engine.on_access(addr(0x40_0000), AccessKind::Read);
            let page = engine.page_map().find(addr(0x40_0000)).unwrap();
            assert_eq!(page.first_touch_thread(), me);
            assert_eq!(page.accesses_by_other_threads(), 0);
        })
    }

    #[test]
    fn first_touch_signal_wins_over_later_access() {
        serial_test(|| {
            let engine = test_engine();
            let me = engine.register_thread();
            let other = me + 1;
            engine.on_first_touch(addr(0x80_0000), other);
            engine.on_access(addr(0x80_0000), AccessKind::Write);
            let page = engine.page_map().find(addr(0x80_0000)).unwrap();
            assert_eq!(page.first_touch_thread(), other);
            // The access came from a thread other than first-touch.
            assert_eq!(page.accesses_by_other_threads(), 1);
        })
    }

    #[test]
    fn escalation_iff_threshold_crossed() {
        serial_test(|| {
            let engine = test_engine();
            engine.register_thread();
            let base = addr(0xc0_0000);
            let threshold = engine.cache_sharing_threshold();
            for _ in 0..threshold {
                engine.on_access(base, AccessKind::Write);
            }
            assert!(engine.cache_line_map().find(base).is_none());
            engine.on_access(base, AccessKind::Write);
            assert!(engine.cache_line_map().find(base).is_some());
            // The neighbouring line is untouched.
            assert!(engine.cache_line_map().find(base + 64usize).is_none());
        })
    }

    #[test]
    fn thread_write_sums_match_page_counter_after_escalation() {
        serial_test(|| {
            let engine = test_engine();
            engine.register_thread();
            let base = addr(0xe0_0000);
            let line = conversions::cache_line_index_in_page(base);
            for _ in 0..500 {
                engine.on_access(base, AccessKind::Write);
                engine.on_access(base + 8usize, AccessKind::Write);
            }
            let page = engine.page_map().find(base).unwrap();
            let detail = engine.cache_line_map().find(base).unwrap();
            let summed: u64 = (0..MAX_THREAD_NUM as u16).map(|t| detail.writes_of(t)).sum();
            // The page counter has every write; the per-thread tables only
            // exist from the write that crossed the threshold onward. With a
            // single uncontended writer nothing is dropped, so the offset is
            // exact.
            assert_eq!(page.cache_line_writes(line), 1000);
            assert_eq!(
                summed + engine.cache_sharing_threshold() as u64,
                page.cache_line_writes(line)
            );
        })
    }

    #[test]
    fn malloc_marks_boundary_lines() {
        serial_test(|| {
            let engine = test_engine();
            engine.register_thread();
            // 16 bytes at a line-aligned start: only the end is inside.
            engine.on_malloc(addr(0x100_0000), 16, 1);
            let page = engine.page_map().find(addr(0x100_0000)).unwrap();
            assert!(page.is_partial_line(0));
            // 64 aligned bytes: no boundary inside any line.
            engine.on_malloc(addr(0x100_0040), 64, 2);
            assert!(!page.is_partial_line(1));
            // An unaligned start marks its line.
            engine.on_malloc(addr(0x100_0090), 0x30, 3);
            assert!(page.is_partial_line(2));
            assert_eq!(engine.registry().live_objects(), 3);
            engine.on_free(addr(0x100_0000));
            engine.on_free(addr(0x100_0040));
            engine.on_free(addr(0x100_0090));
            assert_eq!(engine.registry().live_objects(), 0);
        })
    }

    #[test]
    fn free_without_malloc_is_dropped() {
        serial_test(|| {
            let engine = test_engine();
            engine.register_thread();
            engine.on_free(addr(0x140_0000));
            engine.with_call_sites(|sites| assert!(sites.is_empty()));
        })
    }

    #[test]
    fn double_free_diagnoses_once() {
        serial_test(|| {
            let engine = test_engine();
            engine.register_thread();
            engine.on_malloc(addr(0x180_0000), 64, 9);
            engine.on_free(addr(0x180_0000));
            engine.on_free(addr(0x180_0000));
            engine.with_call_sites(|sites| {
                assert_eq!(sites.get(&9).unwrap().objects_diagnosed(), 1);
            });
        })
    }

    #[test]
    fn thread_ids_are_dense_and_clamped() {
        serial_test(|| {
            let engine = test_engine();
            let first = engine.register_thread();
            // Re-registration hands back the same id.
            assert_eq!(engine.register_thread(), first);
            let next =
                std::thread::scope(|s| s.spawn(|| engine.register_thread()).join().unwrap());
            assert!(next < MAX_THREAD_NUM as u16);
            assert_ne!(next, first);
            // Exhaust the id space: late threads share the last id instead
            // of overflowing the per-thread tables.
            let mut last = 0;
            for _ in 0..MAX_THREAD_NUM + 4 {
                last = std::thread::scope(|s| s.spawn(|| engine.register_thread()).join().unwrap());
                assert!(last < MAX_THREAD_NUM as u16);
            }
            assert_eq!(last, MAX_THREAD_NUM as u16 - 1);
        })
    }
}
