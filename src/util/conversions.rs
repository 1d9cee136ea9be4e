use crate::util::constants::*;
use crate::util::Address;

/// Index of the page containing `addr`, counted from the bottom of the
/// address space.
pub fn page_index(addr: Address) -> usize {
    addr >> LOG_BYTES_IN_PAGE
}

/// Index of the cache line containing `addr`, counted from the bottom of the
/// address space.
pub fn cache_line_index(addr: Address) -> usize {
    addr >> LOG_BYTES_IN_CACHE_LINE
}

/// Index of the cache line containing `addr` within its page (0..64).
pub fn cache_line_index_in_page(addr: Address) -> usize {
    (addr & (BYTES_IN_PAGE - 1)) >> LOG_BYTES_IN_CACHE_LINE
}

/// Index of the word containing `addr` within its cache line (0..8).
pub fn word_index_in_cache_line(addr: Address) -> usize {
    (addr & (BYTES_IN_CACHE_LINE - 1)) >> LOG_BYTES_IN_WORD
}

pub fn page_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_PAGE)
}

pub fn cache_line_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_CACHE_LINE)
}

pub fn is_page_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_PAGE)
}

pub fn raw_align_up(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

pub fn align_up_to_word(size: usize) -> usize {
    raw_align_up(size, BYTES_IN_WORD)
}

pub fn align_up_to_cache_line(size: usize) -> usize {
    raw_align_up(size, BYTES_IN_CACHE_LINE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn page_indices() {
        assert_eq!(page_index(addr(0)), 0);
        assert_eq!(page_index(addr(4095)), 0);
        assert_eq!(page_index(addr(4096)), 1);
        assert_eq!(page_index(addr(0x2000_0000_1000)), 0x2000_0001);
    }

    #[test]
    fn line_indices() {
        assert_eq!(cache_line_index_in_page(addr(0)), 0);
        assert_eq!(cache_line_index_in_page(addr(63)), 0);
        assert_eq!(cache_line_index_in_page(addr(64)), 1);
        assert_eq!(cache_line_index_in_page(addr(4095)), 63);
        // Line index is relative to the enclosing page.
        assert_eq!(cache_line_index_in_page(addr(4096)), 0);
    }

    #[test]
    fn word_indices() {
        assert_eq!(word_index_in_cache_line(addr(0)), 0);
        assert_eq!(word_index_in_cache_line(addr(7)), 0);
        assert_eq!(word_index_in_cache_line(addr(8)), 1);
        assert_eq!(word_index_in_cache_line(addr(63)), 7);
        assert_eq!(word_index_in_cache_line(addr(64)), 0);
    }

    #[test]
    fn align_sizes() {
        assert_eq!(align_up_to_word(0), 0);
        assert_eq!(align_up_to_word(1), 8);
        assert_eq!(align_up_to_word(8), 8);
        assert_eq!(align_up_to_cache_line(1), 64);
        assert_eq!(align_up_to_cache_line(65), 128);
    }
}
