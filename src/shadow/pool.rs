use atomic::Atomic;

use std::sync::atomic::Ordering;
use std::sync::Once;

use crate::util::conversions;
use crate::util::memory::{self, MmapAnnotation, MmapStrategy};
use crate::util::Address;

/// A lock-free bump arena over one anonymous mapping. Backs the lazily
/// materialized side tables of the cache line records (per-thread counter
/// tables, per-word thread bitmasks). Chunks are zeroed (fresh mapping) and
/// are never returned; the arena lives until teardown.
pub struct MetaPool {
    name: &'static str,
    base: Address,
    end: Address,
    cursor: Atomic<Address>,
    exhausted: Once,
}

impl MetaPool {
    pub fn new(name: &'static str, bytes: usize) -> Self {
        let base = memory::mmap_anonymous(bytes, MmapStrategy::META, &MmapAnnotation::Pool { name })
            .unwrap_or_else(|e| panic!("pool {}: cannot map {} bytes: {}", name, bytes, e));
        Self {
            name,
            base,
            end: base + bytes,
            cursor: Atomic::new(base),
            exhausted: Once::new(),
        }
    }

    /// Carve `bytes` out of the arena at the given power-of-two alignment.
    /// `None` once the arena is exhausted; callers drop whatever the chunk
    /// was for.
    pub fn alloc(&self, bytes: usize, align: usize) -> Option<Address> {
        loop {
            let old = self.cursor.load(Ordering::SeqCst);
            let start = old.align_up(align);
            let new = start + conversions::align_up_to_word(bytes);
            if new > self.end {
                self.exhausted.call_once(|| {
                    warn!("pool {}: exhausted, further escalations are dropped", self.name);
                });
                return None;
            }
            if self
                .cursor
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(start);
            }
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.cursor.load(Ordering::SeqCst) - self.base
    }
}

impl Drop for MetaPool {
    fn drop(&mut self) {
        let _ = memory::munmap(self.base, self.end - self.base);
    }
}
