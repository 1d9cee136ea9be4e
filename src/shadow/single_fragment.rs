use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;

use super::{wait_until_inserted, TAG_INSERTED, TAG_INSERTING, TAG_NOT_INSERTED};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MmapAnnotation, MmapStrategy};
use crate::util::Address;

/// The single-fragment shadow map flavor: one page-grained value slot per
/// page of the 48-bit address space, backed by a single `MAP_NORESERVE`
/// mapping created eagerly at construction. Lookups never take a lock and
/// never fault in anything beyond the slots actually touched.
pub struct SingleFragShadowMap<V> {
    name: &'static str,
    block_size: usize,
    base: Address,
    out_of_range: Once,
    _values: PhantomData<V>,
}

unsafe impl<V: Sync> Sync for SingleFragShadowMap<V> {}
unsafe impl<V: Send> Send for SingleFragShadowMap<V> {}

impl<V> SingleFragShadowMap<V> {
    /// Map the shadow region, or panic: the hot path cannot run without it.
    pub fn new(name: &'static str, align_to_cache_line: bool) -> Self {
        let block_size = super::block_size::<V>(align_to_cache_line);
        let total = (1usize << (LOG_ADDRESS_SPACE - LOG_BYTES_IN_PAGE)) * block_size;
        let base = memory::mmap_anonymous(
            total,
            MmapStrategy::SHADOW,
            &MmapAnnotation::ShadowMap { name },
        )
        .unwrap_or_else(|e| panic!("shadow map {}: cannot map {} bytes: {}", name, total, e));
        info!("shadow map {}: mapped at {}", name, base);
        Self {
            name,
            block_size,
            base,
            out_of_range: Once::new(),
            _values: PhantomData,
        }
    }

    fn block(&self, key: Address) -> Option<Address> {
        if key >> LOG_ADDRESS_SPACE != 0 {
            self.out_of_range.call_once(|| {
                warn!(
                    "shadow map {}: address {} outside the supported range, dropping",
                    self.name, key
                );
            });
            return None;
        }
        Some(self.base + conversions::page_index(key) * self.block_size)
    }

    fn tag_of(block: Address) -> &'static AtomicU16 {
        unsafe { block.as_ref::<AtomicU16>() }
    }

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

    pub fn insert(&self, key: Address, value: V) {
        if let Some(block) = self.block(key) {
            unsafe {
                ptr::write((block + super::value_offset::<V>()).to_mut_ptr::<V>(), value);
            }
            Self::tag_of(block).store(TAG_INSERTED, Ordering::SeqCst);
        }
    }

    pub fn find(&self, key: Address) -> Option<&V> {
        let block = self.block(key)?;
        if Self::tag_of(block).load(Ordering::SeqCst) != TAG_INSERTED {
            return None;
        }
        Some(unsafe { (block + super::value_offset::<V>()).as_ref::<V>() })
    }

    /// Clear the whole slot, value bytes included.
    pub fn remove(&self, key: Address) {
        if let Some(block) = self.block(key) {
            memory::zero(block, self.block_size);
        }
    }
}

impl<V> Drop for SingleFragShadowMap<V> {
    fn drop(&mut self) {
        let total = (1usize << (LOG_ADDRESS_SPACE - LOG_BYTES_IN_PAGE)) * self.block_size;
        let _ = memory::munmap(self.base, total);
    }
}
