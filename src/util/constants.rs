use static_assertions::const_assert;

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = 3;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = BYTES_IN_WORD << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a cache line
pub const LOG_BYTES_IN_CACHE_LINE: usize = 6;
/// The number of bytes in a cache line
pub const BYTES_IN_CACHE_LINE: usize = 1 << LOG_BYTES_IN_CACHE_LINE;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// The number of cache lines in a page
pub const CACHE_LINES_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_CACHE_LINE;
/// The number of words in a cache line
pub const WORDS_IN_CACHE_LINE: usize = BYTES_IN_CACHE_LINE / BYTES_IN_WORD;

/// log2 of the supported virtual address space. Accesses above this range are
/// dropped (see the shadow maps).
pub const LOG_ADDRESS_SPACE: usize = 48;

/// log2 of the number of fragments the fragmented shadow maps split the
/// address space into.
pub const LOG_MAX_FRAGMENTS: usize = 8;
/// The number of fragments in a fragmented shadow map
pub const MAX_FRAGMENTS: usize = 1 << LOG_MAX_FRAGMENTS;
/// log2 of the span of target address space covered by one fragment
pub const LOG_BYTES_IN_FRAGMENT: usize = LOG_ADDRESS_SPACE - LOG_MAX_FRAGMENTS;

/// Upper bound on dense thread ids. Threads beyond this bound share the last
/// id. Bounds the per-cache-line per-thread tables and lets thread sets be
/// represented as one-word bitmasks.
pub const MAX_THREAD_NUM: usize = 64;

/// Sentinel for a thread that never went through the thread-start hook.
pub const THREAD_ID_UNASSIGNED: u16 = u16::MAX;

/// A page whose access count by non-first-touch threads exceeds this is
/// escalated to a detailed page record.
pub const DEFAULT_PAGE_SHARING_THRESHOLD: usize = 100;
/// A cache line whose write count exceeds this is escalated to a detailed
/// cache line record.
pub const DEFAULT_CACHE_SHARING_THRESHOLD: usize = 16;
/// Bound for the diagnosis queues (objects per call site, cache lines and
/// pages per object).
pub const DEFAULT_TOP_K: usize = 8;
/// A page's first-touch thread is considered pinned by a different object
/// when its page-wide access count exceeds this multiple of its accesses to
/// the object under diagnosis.
pub const DEFAULT_ALLOCATOR_SHARE_RATIO: usize = 10;
/// Retry budget for counter updates that are allowed to drop under
/// contention. Negative means retry forever.
pub const DEFAULT_COUNTER_RETRIES: isize = 5;

// Thread bitmasks are single words.
const_assert!(MAX_THREAD_NUM <= BITS_IN_WORD);
// The dense id range must leave the sentinel representable.
const_assert!(MAX_THREAD_NUM < THREAD_ID_UNASSIGNED as usize);
const_assert!(LOG_BYTES_IN_FRAGMENT > LOG_BYTES_IN_PAGE);
