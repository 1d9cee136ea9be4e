//! The live-object registry. The allocator interception layer registers
//! every allocation by base address and always passes the base address back
//! at free, so no range search is needed: a fixed-size open-addressed table
//! with bounded linear probing is enough, and every operation is constant
//! time.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Once;

use crate::record::{CallSite, ObjectInfo};
use crate::shadow::{TAG_INSERTED, TAG_INSERTING, TAG_NOT_INSERTED, TAG_REMOVED};
use crate::util::constants::*;
use crate::util::memory::{self, MmapAnnotation, MmapStrategy};
use crate::util::Address;

/// log2 of the number of slots.
const LOG_REGISTRY_SLOTS: usize = 20;
const REGISTRY_SLOTS: usize = 1 << LOG_REGISTRY_SLOTS;
/// An insert or lookup gives up after probing this many slots.
const PROBE_LIMIT: usize = 128;

/// One table slot. Slots follow the shadow map tag protocol, extended with
/// [`TAG_REMOVED`]: a tombstone keeps probe chains intact, and may be
/// reclaimed by a later insert. The payload fields are only written between
/// the claim and the publication of the tag, so relaxed accesses suffice;
/// the tag carries the ordering.
#[repr(C)]
struct Slot {
    tag: AtomicU16,
    call_site: AtomicU32,
    start: AtomicUsize,
    size: AtomicUsize,
}

pub struct ObjectRegistry {
    table: Address,
    live: AtomicUsize,
    overflow: Once,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        let bytes = REGISTRY_SLOTS * std::mem::size_of::<Slot>();
        let table = memory::mmap_anonymous(bytes, MmapStrategy::META, &MmapAnnotation::Registry)
            .unwrap_or_else(|e| panic!("object registry: cannot map {} bytes: {}", bytes, e));
        Self {
            table,
            live: AtomicUsize::new(0),
            overflow: Once::new(),
        }
    }

    fn slot(&self, index: usize) -> &Slot {
        debug_assert!(index < REGISTRY_SLOTS);
        unsafe { (self.table + index * std::mem::size_of::<Slot>()).as_ref::<Slot>() }
    }

    fn home(start: Address) -> usize {
        // Fibonacci hashing over the word-aligned base address.
        let key = (start >> LOG_BYTES_IN_WORD) as u64;
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - LOG_REGISTRY_SLOTS as u32)) as usize
    }

    /// Register a live object. Returns false when the probe window is
    /// exhausted and the object goes untracked.
    pub fn register(&self, info: ObjectInfo) -> bool {
        let home = Self::home(info.start);
        for probe in 0..PROBE_LIMIT {
            let slot = self.slot((home + probe) & (REGISTRY_SLOTS - 1));
            let tag = slot.tag.load(Ordering::SeqCst);
            match tag {
                TAG_NOT_INSERTED | TAG_REMOVED => {
                    if slot
                        .tag
                        .compare_exchange(tag, TAG_INSERTING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        // Lost the slot; try the next one.
                        continue;
                    }
                    slot.start.store(info.start.as_usize(), Ordering::Relaxed);
                    slot.size.store(info.size, Ordering::Relaxed);
                    slot.call_site.store(info.call_site, Ordering::Relaxed);
                    slot.tag.store(TAG_INSERTED, Ordering::SeqCst);
                    self.live.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                TAG_INSERTED => {
                    if slot.start.load(Ordering::Relaxed) == info.start.as_usize() {
                        // The address is live again without an intervening
                        // free; take over the slot in place.
                        slot.size.store(info.size, Ordering::Relaxed);
                        slot.call_site.store(info.call_site, Ordering::Relaxed);
                        return true;
                    }
                }
                _ => {}
            }
        }
        self.overflow.call_once(|| {
            warn!("object registry: probe window full, dropping registrations");
        });
        false
    }

    /// Look up a live object by its base address.
    pub fn lookup(&self, start: Address) -> Option<ObjectInfo> {
        let home = Self::home(start);
        for probe in 0..PROBE_LIMIT {
            let slot = self.slot((home + probe) & (REGISTRY_SLOTS - 1));
            match slot.tag.load(Ordering::SeqCst) {
                TAG_NOT_INSERTED => return None,
                TAG_INSERTED if slot.start.load(Ordering::Relaxed) == start.as_usize() => {
                    return Some(self.read_info(slot));
                }
                _ => {}
            }
        }
        None
    }

    /// Atomically claim and remove the object at `start`. `None` when the
    /// address is not registered, including the second of two racing frees.
    pub fn unregister(&self, start: Address) -> Option<ObjectInfo> {
        let home = Self::home(start);
        for probe in 0..PROBE_LIMIT {
            let slot = self.slot((home + probe) & (REGISTRY_SLOTS - 1));
            match slot.tag.load(Ordering::SeqCst) {
                TAG_NOT_INSERTED => return None,
                TAG_INSERTED if slot.start.load(Ordering::Relaxed) == start.as_usize() => {
                    let info = self.read_info(slot);
                    if slot
                        .tag
                        .compare_exchange(
                            TAG_INSERTED,
                            TAG_REMOVED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.live.fetch_sub(1, Ordering::SeqCst);
                        return Some(info);
                    }
                    return None;
                }
                _ => {}
            }
        }
        None
    }

    fn read_info(&self, slot: &Slot) -> ObjectInfo {
        ObjectInfo::new(
            unsafe { Address::from_usize(slot.start.load(Ordering::Relaxed)) },
            slot.size.load(Ordering::Relaxed),
            slot.call_site.load(Ordering::Relaxed) as CallSite,
        )
    }

    /// The number of currently registered objects.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for ObjectRegistry {
    fn drop(&mut self) {
        let bytes = REGISTRY_SLOTS * std::mem::size_of::<Slot>();
        let _ = memory::munmap(self.table, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = ObjectRegistry::new();
        let info = ObjectInfo::new(addr(0x7000_0000), 128, 4);
        assert!(registry.register(info));
        assert_eq!(registry.live_objects(), 1);
        assert_eq!(registry.lookup(addr(0x7000_0000)), Some(info));
        assert_eq!(registry.unregister(addr(0x7000_0000)), Some(info));
        assert_eq!(registry.live_objects(), 0);
        assert_eq!(registry.lookup(addr(0x7000_0000)), None);
    }

    #[test]
    fn double_unregister_returns_none_once() {
        let registry = ObjectRegistry::new();
        let info = ObjectInfo::new(addr(0x1000), 64, 1);
        registry.register(info);
        assert!(registry.unregister(addr(0x1000)).is_some());
        assert!(registry.unregister(addr(0x1000)).is_none());
    }

    #[test]
    fn unknown_address_is_none() {
        let registry = ObjectRegistry::new();
        assert!(registry.lookup(addr(0xdead_000)).is_none());
        assert!(registry.unregister(addr(0xdead_000)).is_none());
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let registry = ObjectRegistry::new();
        let first = ObjectInfo::new(addr(0x2000), 64, 1);
        registry.register(first);
        registry.unregister(addr(0x2000));
        let second = ObjectInfo::new(addr(0x2000), 32, 9);
        assert!(registry.register(second));
        assert_eq!(registry.lookup(addr(0x2000)), Some(second));
    }

    #[test]
    fn many_objects() {
        let registry = ObjectRegistry::new();
        for i in 0..10_000usize {
            let info = ObjectInfo::new(addr(0x10_0000 + i * 64), 64, (i % 7) as CallSite);
            assert!(registry.register(info));
        }
        assert_eq!(registry.live_objects(), 10_000);
        for i in 0..10_000usize {
            let start = addr(0x10_0000 + i * 64);
            assert_eq!(registry.lookup(start).map(|o| o.call_site), Some((i % 7) as CallSite));
            assert!(registry.unregister(start).is_some());
        }
        assert_eq!(registry.live_objects(), 0);
    }

    #[test]
    fn concurrent_churn_balances() {
        use std::sync::Arc;
        let registry = Arc::new(ObjectRegistry::new());
        let threads: Vec<_> = (0..8usize)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let base = 0x5000_0000 + t * 0x100_0000;
                    for i in 0..2_000usize {
                        let start = addr(base + i * 64);
                        assert!(registry.register(ObjectInfo::new(start, 64, t as CallSite)));
                        assert!(registry.unregister(start).is_some());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.live_objects(), 0);
    }
}
