use crate::util::constants::*;
use crate::util::conversions;
use crate::util::Address;

/// Identifier of an allocation site, assigned by the compile-time pass.
/// Stable within a run, not across runs.
pub type CallSite = u32;

/// One live heap object, as reported by the allocation hook. At most one
/// live record exists per start address; objects from the same call site are
/// distinct records that aggregate into one diagnosis bucket when freed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub start: Address,
    pub size: usize,
    pub call_site: CallSite,
}

impl ObjectInfo {
    pub fn new(start: Address, size: usize, call_site: CallSite) -> Self {
        Self {
            start,
            size,
            call_site,
        }
    }

    /// One past the last byte of the object.
    pub fn end(&self) -> Address {
        self.start + self.size
    }

    /// The number of cache lines the object's extent intersects.
    pub fn cache_lines_spanned(&self) -> usize {
        if self.size == 0 {
            return 0;
        }
        let first = conversions::cache_line_index(self.start);
        let last = conversions::cache_line_index(self.end() - 1usize);
        last - first + 1
    }

    pub fn spans_multiple_cache_lines(&self) -> bool {
        self.cache_lines_spanned() > 1
    }

    /// Does the object's start fall strictly inside its first cache line?
    pub fn starts_inside_cache_line(&self) -> bool {
        !self.start.is_aligned_to(BYTES_IN_CACHE_LINE)
    }

    /// Does the object's end fall strictly inside its last cache line?
    pub fn ends_inside_cache_line(&self) -> bool {
        !self.end().is_aligned_to(BYTES_IN_CACHE_LINE)
    }
}
