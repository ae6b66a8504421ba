//! Address types for physical and virtual memory.
//!
//! Both types are 32 bits wide, matching the i386 linear and physical address
//! spaces without PAE. There is deliberately no conversion between them: a
//! physical address only becomes reachable through a [`PhysicalMemory`]
//! implementation or through a page-table walk.
//!
//! [`PhysicalMemory`]: crate::PhysicalMemory

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns the raw address value widened to `usize`.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u32) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: u32) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two, or if the aligned
            /// address does not fit in 32 bits.
            #[inline]
            pub const fn align_up(self, align: u32) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                match self.0.checked_add(align - 1) {
                    Some(raised) => Self(raised & !(align - 1)),
                    None => panic!("address overflow while aligning up"),
                }
            }

            /// Adds `rhs` bytes, returning `None` on overflow past 4 GiB.
            #[inline]
            pub const fn checked_add(self, rhs: u32) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }

            /// Returns the byte offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> u32 {
                self.0 & (arch::PAGE_SIZE as u32 - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self::new(addr)
            }
        }

        impl Add<u32> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u32) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<u32> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u32) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u32;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Page directory and page table entries only ever hold physical addresses.\n\
     A physical address is never dereferenced directly."
);

impl PhysicalAddress {
    /// Returns the frame number containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE as u32)
    }
}

impl_address_common!(
    VirtualAddress,
    "A linear (virtual) memory address.\n\n\
     This is the address as seen by executing code, before page translation."
);

impl VirtualAddress {
    /// Returns the index into the page directory (bits 22-31).
    #[inline]
    pub const fn directory_index(self) -> usize {
        arch::directory_index(self.0)
    }

    /// Returns the index into the page table (bits 12-21).
    #[inline]
    pub const fn table_index(self) -> usize {
        arch::table_index(self.0)
    }

    /// Returns true if the address lies in the kernel half shared by every
    /// address space.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= arch::KERNEL_BASE
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_and_raw() {
            let addr = PhysicalAddress::new(0x1234);
            assert_eq!(addr.as_u32(), 0x1234);
            assert_eq!(addr.as_usize(), 0x1234);
        }

        #[test]
        fn full_32_bit_range() {
            let addr = PhysicalAddress::new(u32::MAX);
            assert_eq!(addr.as_u32(), 0xFFFF_FFFF);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(0x4000);
            assert!(addr.is_aligned(0x1000));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(0x8000));
        }

        #[test]
        fn align_down_and_up() {
            let addr = PhysicalAddress::new(0x1234);
            assert_eq!(addr.align_down(0x1000), PhysicalAddress::new(0x1000));
            assert_eq!(addr.align_up(0x1000), PhysicalAddress::new(0x2000));
            assert_eq!(addr.align_up(4), PhysicalAddress::new(0x1234));
        }

        #[test]
        #[should_panic(expected = "address overflow while aligning up")]
        fn align_up_overflow() {
            PhysicalAddress::new(0xFFFF_F001).align_up(0x1000);
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(0x0000_5FFF);
            assert_eq!(addr.frame_number(), FrameNumber::new(5));
        }

        #[test]
        fn arithmetic() {
            let addr = PhysicalAddress::new(0x100);
            assert_eq!((addr + 0x50).as_u32(), 0x150);
            assert_eq!((addr - 0x50).as_u32(), 0xB0);
            assert_eq!(PhysicalAddress::new(0x150) - addr, 0x50);
            assert_eq!(PhysicalAddress::new(u32::MAX).checked_add(1), None);
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x100);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x00000100)");
            assert_eq!(format!("{}", addr), "0x00000100");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn indices_split_10_10_12() {
            // 0xC0403123 = directory 769, table 3, offset 0x123
            let addr = VirtualAddress::new(0xC040_3123);
            assert_eq!(addr.directory_index(), 769);
            assert_eq!(addr.table_index(), 3);
            assert_eq!(addr.page_offset(), 0x123);
        }

        #[test]
        fn indices_at_extremes() {
            let low = VirtualAddress::new(0);
            assert_eq!((low.directory_index(), low.table_index()), (0, 0));

            let high = VirtualAddress::new(0xFFFF_FFFF);
            assert_eq!(high.directory_index(), 1023);
            assert_eq!(high.table_index(), 1023);
            assert_eq!(high.page_offset(), 0xFFF);
        }

        #[test]
        fn kernel_boundary() {
            assert!(!VirtualAddress::new(0xBFFF_FFFF).is_kernel());
            assert!(VirtualAddress::new(0xC000_0000).is_kernel());
        }

        #[test]
        fn pointer_conversion() {
            let addr = VirtualAddress::new(0x0100);
            let ptr: *const u8 = addr.as_ptr();
            assert_eq!(ptr as usize, 0x0100);
        }
    }
}
