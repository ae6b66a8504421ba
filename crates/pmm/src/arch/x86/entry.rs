//! Page directory / page table entry for i386.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single 32-bit page directory or page table entry.
///
/// Bits 12-31 hold the 4 KiB-aligned physical address of the next-level table
/// (for a directory entry) or of the mapped frame (for a table entry). Bits 0-11
/// hold [`PageFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical address mask (bits 12-31).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// A not-present entry.
    pub const EMPTY: Self = Self(0);

    /// Creates a new entry.
    ///
    /// The physical address must be page-aligned (lowest 12 bits must be zero).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.page_offset() == 0,
            "physical address must be page-aligned"
        );

        Self((address.as_u32() & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits(self.0)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | flags.bits();
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for PageEntry {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_address_and_flags() {
        let entry = PageEntry::new(PhysicalAddress::new(0x0012_3000), PageFlags::user_data());
        assert_eq!(entry.as_u32(), 0x0012_3007);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x0012_3000)));
    }

    #[test]
    fn not_present_has_no_address() {
        let entry = PageEntry::from(0x0012_3006);
        assert!(!entry.is_present());
        assert_eq!(entry.address(), None);
    }

    #[test]
    fn set_flags_keeps_address() {
        let mut entry = PageEntry::new(PhysicalAddress::new(0xFFFF_F000), PageFlags::user_data());
        entry.set_flags(PageFlags::new(false, true));
        assert_eq!(entry.as_u32(), 0xFFFF_F005);
        entry.clear();
        assert_eq!(entry, PageEntry::default());
    }
}
