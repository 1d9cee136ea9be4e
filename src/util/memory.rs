//! Thin wrappers around the OS memory mapping calls. Shadow storage is
//! allocated as private anonymous mappings with `MAP_NORESERVE`, and advised
//! away from transparent huge pages so that the kernel's first-touch
//! placement stays at 4 KiB granularity.

use std::io::{Error, Result};

use crate::util::Address;

/// Strategy for performing mmap
#[derive(Debug, Copy, Clone)]
pub struct MmapStrategy {
    /// The protection flags for mmap
    pub prot: MmapProtection,
    /// Should the mapping count against the commit charge?
    pub reserve: bool,
    /// Huge page policy for the mapped range
    pub huge_page: HugePageSupport,
}

impl MmapStrategy {
    /// The strategy for shadow storage: unreserved, and kept on 4 KiB pages.
    pub const SHADOW: Self = Self {
        prot: MmapProtection::ReadWrite,
        reserve: false,
        huge_page: HugePageSupport::NoTransparentHugePages,
    };

    /// The strategy for the profiler's own side tables.
    pub const META: Self = Self {
        prot: MmapProtection::ReadWrite,
        reserve: false,
        huge_page: HugePageSupport::No,
    };

    #[cfg(test)]
    pub const TEST: Self = Self::META;
}

/// The protection flags for mmap
#[repr(i32)]
#[derive(Debug, Copy, Clone)]
pub enum MmapProtection {
    /// Allow read + write
    ReadWrite,
    /// Do not allow any access
    NoAccess,
}

impl MmapProtection {
    fn get_native_flags(&self) -> i32 {
        use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::NoAccess => PROT_NONE,
        }
    }
}

/// Huge page policy for a mapping
#[derive(Debug, Copy, Clone)]
pub enum HugePageSupport {
    /// Leave the kernel default in place
    No,
    /// Advise the range away from transparent huge pages
    NoTransparentHugePages,
}

/// Annotation for an mmap entry. On Linux the annotation becomes the
/// human-readable VMA name via `prctl(PR_SET_VMA)`, which makes the shadow
/// regions identifiable in `/proc/self/maps`. Ignored elsewhere.
pub enum MmapAnnotation<'a> {
    /// A shadow map fragment.
    ShadowMap {
        /// The name of the map.
        name: &'a str,
    },
    /// A side-table arena.
    Pool {
        /// The name of the pool.
        name: &'a str,
    },
    /// The object registry table.
    Registry,
    /// A test mapping. Usually constructed using the [`mmap_anno_test!`] macro.
    Test {
        /// The source file.
        file: &'a str,
        /// The line number.
        line: u32,
    },
}

/// Construct an `MmapAnnotation::Test` with the current file name and line number.
#[macro_export]
macro_rules! mmap_anno_test {
    () => {
        &$crate::util::memory::MmapAnnotation::Test {
            file: file!(),
            line: line!(),
        }
    };
}

pub use mmap_anno_test;

impl std::fmt::Display for MmapAnnotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmapAnnotation::ShadowMap { name } => write!(f, "numasight:shadow:{name}"),
            MmapAnnotation::Pool { name } => write!(f, "numasight:pool:{name}"),
            MmapAnnotation::Registry => write!(f, "numasight:registry"),
            MmapAnnotation::Test { file, line } => write!(f, "numasight:test:{file}:{line}"),
        }
    }
}

impl MmapStrategy {
    fn get_mmap_flags(&self) -> i32 {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if !self.reserve {
            flags |= libc::MAP_NORESERVE;
        }
        flags
    }
}

/// Map a fresh anonymous region of `size` bytes at a kernel-chosen address.
/// The contents start zeroed.
pub fn mmap_anonymous(
    size: usize,
    strategy: MmapStrategy,
    annotation: &MmapAnnotation<'_>,
) -> Result<Address> {
    let prot = strategy.prot.get_native_flags();
    let flags = strategy.get_mmap_flags();
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    let addr = Address::from_mut_ptr(ptr);

    set_vma_name(addr, size, annotation);

    match strategy.huge_page {
        HugePageSupport::No => {}
        HugePageSupport::NoTransparentHugePages => set_no_huge_pages(addr, size)?,
    }
    Ok(addr)
}

#[cfg(target_os = "linux")]
fn set_no_huge_pages(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_NOHUGEPAGE) },
        0,
    )
}

#[cfg(not(target_os = "linux"))]
fn set_no_huge_pages(_start: Address, _size: usize) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_vma_name(start: Address, size: usize, annotation: &MmapAnnotation<'_>) {
    // `PR_SET_VMA` is new in Linux 5.17. On older kernels `prctl` returns
    // `EINVAL`, as it does for a formatted name longer than 80 bytes. The
    // name is purely for debugging, so errors are only logged.
    let anno_cstr = match std::ffi::CString::new(annotation.to_string()) {
        Ok(s) => s,
        Err(_) => return,
    };
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_vma_name(_start: Address, _size: usize, _annotation: &MmapAnnotation<'_>) {}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_zeroed_and_writable() {
        let size = 2 * crate::util::constants::BYTES_IN_PAGE;
        let addr = mmap_anonymous(size, MmapStrategy::TEST, mmap_anno_test!()).unwrap();
        assert!(!addr.is_zero());
        unsafe {
            assert_eq!(*addr.to_ptr::<u64>(), 0);
            *addr.to_mut_ptr::<u64>() = 0xdead_beef;
            assert_eq!(*addr.to_ptr::<u64>(), 0xdead_beef);
        }
        munmap(addr, size).unwrap();
    }

    #[test]
    fn zero_clears() {
        let size = crate::util::constants::BYTES_IN_PAGE;
        let addr = mmap_anonymous(size, MmapStrategy::TEST, mmap_anno_test!()).unwrap();
        set(addr, 0xff, size);
        zero(addr, size);
        unsafe {
            assert_eq!(*addr.to_ptr::<u64>(), 0);
        }
        munmap(addr, size).unwrap();
    }
}
