use atomic::Atomic;
use spin::Mutex;

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;

use super::{wait_until_inserted, TAG_INSERTED, TAG_INSERTING, TAG_NOT_INSERTED};
use crate::util::constants::*;
use crate::util::memory::{self, MmapAnnotation, MmapStrategy};
use crate::util::Address;

/// An address-keyed shadow map over the 48-bit address space, split into
/// [`MAX_FRAGMENTS`] equally sized segments. A fragment's backing mapping is
/// created the first time any address inside it is touched; creation takes
/// the per-map lock, with a second check under the lock so racing creators
/// map each fragment once. Everything else is lock free.
///
/// One value slot exists per `1 << log_bytes_in_grain` bytes of target
/// address space, so the same container shadows pages and cache lines.
pub struct ShadowMap<V> {
    name: &'static str,
    log_bytes_in_grain: usize,
    block_size: usize,
    fragments: [Atomic<Address>; MAX_FRAGMENTS],
    lock: Mutex<()>,
    out_of_range: Once,
    _values: PhantomData<V>,
}

// Values are only ever mutated through atomics behind shared references.
unsafe impl<V: Sync> Sync for ShadowMap<V> {}
unsafe impl<V: Send> Send for ShadowMap<V> {}

impl<V> ShadowMap<V> {
    pub fn new(name: &'static str, log_bytes_in_grain: usize, align_to_cache_line: bool) -> Self {
        debug_assert!(log_bytes_in_grain < LOG_BYTES_IN_FRAGMENT);
        Self {
            name,
            log_bytes_in_grain,
            block_size: super::block_size::<V>(align_to_cache_line),
            fragments: std::array::from_fn(|_| Atomic::new(Address::ZERO)),
            lock: Mutex::new(()),
            out_of_range: Once::new(),
            _values: PhantomData,
        }
    }

    /// Bytes of shadow backing one fragment.
    fn fragment_bytes(&self) -> usize {
        (1usize << (LOG_BYTES_IN_FRAGMENT - self.log_bytes_in_grain)) * self.block_size
    }

    fn fragment_index(&self, key: Address) -> Option<usize> {
        let index = key >> LOG_BYTES_IN_FRAGMENT;
        if index >= MAX_FRAGMENTS {
            self.out_of_range.call_once(|| {
                warn!(
                    "shadow map {}: address {} outside the supported range, dropping",
                    self.name, key
                );
            });
            return None;
        }
        Some(index)
    }

    fn block_in_fragment(&self, base: Address, key: Address) -> Address {
        let grain_index = (key & ((1usize << LOG_BYTES_IN_FRAGMENT) - 1)) >> self.log_bytes_in_grain;
        let offset = grain_index * self.block_size;
        #[cfg(feature = "extreme_assertions")]
        assert!(offset < self.fragment_bytes());
        base + offset
    }

    /// The slot block for `key`, if its fragment has been mapped.
    fn find_block(&self, key: Address) -> Option<Address> {
        let index = self.fragment_index(key)?;
        let base = self.fragments[index].load(Ordering::SeqCst);
        if base.is_zero() {
            return None;
        }
        Some(self.block_in_fragment(base, key))
    }

    /// The slot block for `key`, mapping the fragment if needed. `None` only
    /// for keys outside the supported range or if the kernel refuses the
    /// mapping.
    fn block(&self, key: Address) -> Option<Address> {
        let index = self.fragment_index(key)?;
        let base = self.fragments[index].load(Ordering::SeqCst);
        if !base.is_zero() {
            return Some(self.block_in_fragment(base, key));
        }
        self.create_fragment(index);
        let base = self.fragments[index].load(Ordering::SeqCst);
        if base.is_zero() {
            return None;
        }
        Some(self.block_in_fragment(base, key))
    }

    fn create_fragment(&self, index: usize) {
        let _guard = self.lock.lock();
        // Check again under the lock; another thread may have mapped it.
        if !self.fragments[index].load(Ordering::SeqCst).is_zero() {
            return;
        }
        match memory::mmap_anonymous(
            self.fragment_bytes(),
            MmapStrategy::SHADOW,
            &MmapAnnotation::ShadowMap { name: self.name },
        ) {
            Ok(base) => {
                info!("shadow map {}: mapped fragment {}", self.name, index);
                self.fragments[index].store(base, Ordering::SeqCst);
            }
            Err(e) => {
                panic!(
                    "shadow map {}: cannot map fragment {} ({} bytes): {}",
                    self.name,
                    index,
                    self.fragment_bytes(),
                    e
                );
            }
        }
    }

    fn tag_of(block: Address) -> &'static AtomicU16 {
        unsafe { block.as_ref::<AtomicU16>() }
    }

    fn value_of<'a>(&self, block: Address) -> &'a V {
        unsafe { (block + super::value_offset::<V>()).as_ref::<V>() }
    }

    /// Insert a value for `key` unless one is already present. Returns true
    /// when this call's value was installed. A loser waits for the winner's
    /// publication, so a following `find` observes the value either way.
    pub fn insert_if_absent(&self, key: Address, value: V) -> bool {
        let block = match self.block(key) {
            Some(b) => b,
            None => return false,
        };
        let tag = Self::tag_of(block);
        match tag.compare_exchange(
            TAG_NOT_INSERTED,
            TAG_INSERTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                unsafe {
                    ptr::write((block + super::value_offset::<V>()).to_mut_ptr::<V>(), value);
                }
                tag.store(TAG_INSERTED, Ordering::SeqCst);
                true
            }
            Err(_) => {
                // Busy waiting, since this could be very quick.
                wait_until_inserted(tag);
                false
            }
        }
    }

    /// Insert a value for `key`, overwriting whatever the slot held. Not for
    /// use when racing readers may hold the old value.
    pub fn insert(&self, key: Address, value: V) {
        if let Some(block) = self.block(key) {
            unsafe {
                ptr::write((block + super::value_offset::<V>()).to_mut_ptr::<V>(), value);
            }
            Self::tag_of(block).store(TAG_INSERTED, Ordering::SeqCst);
        }
    }

    pub fn find(&self, key: Address) -> Option<&V> {
        let block = self.find_block(key)?;
        if Self::tag_of(block).load(Ordering::SeqCst) != TAG_INSERTED {
            return None;
        }
        Some(self.value_of(block))
    }

    pub fn remove(&self, key: Address) {
        if let Some(block) = self.find_block(key) {
            Self::tag_of(block).store(TAG_NOT_INSERTED, Ordering::SeqCst);
        }
    }
}

impl<V> Drop for ShadowMap<V> {
    fn drop(&mut self) {
        for fragment in &self.fragments {
            let base = fragment.load(Ordering::SeqCst);
            if !base.is_zero() {
                let _ = memory::munmap(base, self.fragment_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn find_before_insert_is_none() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_find", LOG_BYTES_IN_PAGE, false);
        assert!(map.find(addr(0x1000)).is_none());
    }

    #[test]
    fn insert_then_find() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_insert", LOG_BYTES_IN_PAGE, false);
        assert!(map.insert_if_absent(addr(0x2000), AtomicU64::new(42)));
        let v = map.find(addr(0x2000)).unwrap();
        assert_eq!(v.load(Ordering::SeqCst), 42);
        // Any address within the same grain hits the same slot.
        let same = map.find(addr(0x2fff)).unwrap();
        assert_eq!(same.load(Ordering::SeqCst), 42);
        // The neighbouring grain is separate.
        assert!(map.find(addr(0x3000)).is_none());
    }

    #[test]
    fn second_insert_loses() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_second", LOG_BYTES_IN_PAGE, false);
        assert!(map.insert_if_absent(addr(0x5000), AtomicU64::new(1)));
        assert!(!map.insert_if_absent(addr(0x5000), AtomicU64::new(2)));
        assert_eq!(map.find(addr(0x5000)).unwrap().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_frees_slot_for_reinsertion() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_remove", LOG_BYTES_IN_PAGE, false);
        map.insert_if_absent(addr(0x7000), AtomicU64::new(5));
        map.remove(addr(0x7000));
        assert!(map.find(addr(0x7000)).is_none());
        assert!(map.insert_if_absent(addr(0x7000), AtomicU64::new(6)));
        assert_eq!(map.find(addr(0x7000)).unwrap().load(Ordering::SeqCst), 6);
    }

    #[test]
    fn out_of_range_keys_are_dropped() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_range", LOG_BYTES_IN_PAGE, false);
        let beyond = addr(1usize << LOG_ADDRESS_SPACE);
        assert!(!map.insert_if_absent(beyond, AtomicU64::new(1)));
        assert!(map.find(beyond).is_none());
    }

    #[test]
    fn distinct_fragments() {
        let map: ShadowMap<AtomicU64> = ShadowMap::new("test_frags", LOG_BYTES_IN_PAGE, false);
        let low = addr(0x1000);
        let high = addr(0x7f00_0000_0000);
        assert!(map.insert_if_absent(low, AtomicU64::new(1)));
        assert!(map.insert_if_absent(high, AtomicU64::new(2)));
        assert_eq!(map.find(low).unwrap().load(Ordering::SeqCst), 1);
        assert_eq!(map.find(high).unwrap().load(Ordering::SeqCst), 2);
    }

    #[test]
    fn racing_inserters_agree() {
        use std::sync::Arc;
        let map: Arc<ShadowMap<AtomicU64>> =
            Arc::new(ShadowMap::new("test_race", LOG_BYTES_IN_PAGE, false));
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || map.insert_if_absent(addr(0x9000), AtomicU64::new(t)))
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(map.find(addr(0x9000)).unwrap().load(Ordering::SeqCst) < 8);
    }
}
