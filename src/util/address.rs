use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;

/// size in bytes
pub type ByteSize = usize;

/// Address represents an arbitrary virtual address, both target-program
/// addresses used as shadow map keys and addresses of the profiler's own
/// mappings. It is designed to do address arithmetic mostly in a safe way
/// and to mark some operations as unsafe; it needs to be zero overhead
/// (memory wise and time wise).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// creates Address from a mutable pointer
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// creates an Address from a usize. The caller is responsible for the
    /// meaningfulness of the raw value.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// the raw numeric value
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// is this the zero address?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns up the address to the given alignment (power of two)
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// aligns down the address to the given alignment (power of two)
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// is this address aligned to the given alignment?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a raw pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable raw pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// converts the Address to a reference. The caller must guarantee the
    /// address actually points to a live, initialized `T`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        &*self.to_ptr::<T>()
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn align_up() {
        let addr = unsafe { Address::from_usize(0x123) };
        assert_eq!(addr.align_up(64), unsafe { Address::from_usize(0x140) });
        let aligned = unsafe { Address::from_usize(0x140) };
        assert_eq!(aligned.align_up(64), aligned);
    }

    #[test]
    fn align_down() {
        let addr = unsafe { Address::from_usize(0x123) };
        assert_eq!(addr.align_down(64), unsafe { Address::from_usize(0x100) });
    }

    #[test]
    fn is_aligned_to() {
        assert!(Address::ZERO.is_aligned_to(4096));
        assert!(!unsafe { Address::from_usize(0x10) }.is_aligned_to(64));
        assert!(unsafe { Address::from_usize(0x40) }.is_aligned_to(64));
    }

    #[test]
    fn arithmetic() {
        let a = unsafe { Address::from_usize(0x1000) };
        let b = a + 0x40usize;
        assert_eq!(b - a, 0x40);
        assert_eq!(b - 0x40usize, a);
    }
}
