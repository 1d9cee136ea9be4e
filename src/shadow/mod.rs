//! Shadow storage for the target program's address space.
//!
//! A shadow map associates a fixed-size value slot with every grain (page or
//! cache line) of the 48-bit address space. Slots live in large anonymous
//! `MAP_NORESERVE` mappings, so untouched slots cost nothing. Each slot is
//! laid out as a 16-bit tag followed by the value:
//!
//! ```text
//! tag-value tag-value tag-value ...
//! ```
//!
//! The tag guards at-most-once in-place construction. Writers claim a slot
//! by a compare-and-set from [`TAG_NOT_INSERTED`] to [`TAG_INSERTING`],
//! construct the value, then publish with [`TAG_INSERTED`]. A reader that
//! observes `TAG_INSERTED` (sequentially consistent load) has a
//! happens-before edge to the writer's construction. Losers of the claim
//! busy-wait for the publication, which is expected to be brief.
//!
//! Two flavors exist: [`ShadowMap`] partitions the address space into
//! lazily mapped fragments, [`SingleFragShadowMap`] uses one eager mapping.
//! Lazily materialized side tables (per-thread counters, per-word bitmasks)
//! come from a [`MetaPool`].

pub(crate) mod fragmented;
pub(crate) mod pool;
pub(crate) mod single_fragment;

pub use fragmented::ShadowMap;
pub use pool::MetaPool;
pub use single_fragment::SingleFragShadowMap;

use crate::util::conversions;
use std::mem;
use std::sync::atomic::{AtomicU16, Ordering};

/// Slot has never held a value.
pub const TAG_NOT_INSERTED: u16 = 0;
/// A writer is constructing the value in place.
pub const TAG_INSERTING: u16 = 1;
/// The value is published and may be read.
pub const TAG_INSERTED: u16 = 2;
/// The value was removed. Only the object registry uses this state; the
/// shadow maps recycle removed slots straight back to `TAG_NOT_INSERTED`.
pub const TAG_REMOVED: u16 = 3;

/// The bytes reserved for a slot tag.
pub const BYTES_IN_TAG: usize = mem::size_of::<u16>();

/// Byte offset of the value within a slot block, respecting the value's
/// alignment.
pub(crate) fn value_offset<V>() -> usize {
    conversions::raw_align_up(BYTES_IN_TAG, mem::align_of::<V>())
}

/// Size of one slot block: tag plus value, aligned up to a word or to a
/// cache line. Cache line alignment keeps neighbouring slots of write-hot
/// maps from sharing lines in the shadow itself.
pub(crate) fn block_size<V>(align_to_cache_line: bool) -> usize {
    let raw = value_offset::<V>() + mem::size_of::<V>();
    if align_to_cache_line {
        conversions::align_up_to_cache_line(raw)
    } else {
        conversions::align_up_to_word(raw)
    }
}

/// Spin until a concurrent writer publishes the slot.
pub(crate) fn wait_until_inserted(tag: &AtomicU16) {
    while tag.load(Ordering::SeqCst) != TAG_INSERTED {
        std::hint::spin_loop();
    }
}
