//! Page directory and page table entry flags for i386.

use x86_64::structures::paging::PageTableFlags;

/// Page directory / page table entry flags for i386.
///
/// The low twelve bits of a 32-bit i386 entry have the same layout as the low
/// twelve bits of a long-mode entry, so this wraps the x86_64 crate's flags and
/// masks off everything above bit 11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    /// Mask of the bits that hold flags in a 32-bit entry.
    pub const MASK: u32 = 0xFFF;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Present flags for a leaf mapping with the given permissions.
    pub fn new(writable: bool, user_accessible: bool) -> Self {
        let mut flags = Self(PageTableFlags::PRESENT);
        flags.set_writable(writable);
        flags.set_user(user_accessible);
        flags
    }

    /// Present, writable, supervisor-only.
    pub fn kernel_data() -> Self {
        Self::new(true, false)
    }

    /// Present, writable, user-accessible.
    pub fn user_data() -> Self {
        Self::new(true, true)
    }

    /// Creates page flags from the low bits of a raw entry.
    pub const fn from_bits(bits: u32) -> Self {
        Self(PageTableFlags::from_bits_truncate((bits & Self::MASK) as u64))
    }

    /// Returns the raw bits of these flags.
    pub const fn bits(self) -> u32 {
        self.0.bits() as u32 & Self::MASK
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Returns whether this is a 4 MiB page directory entry.
    pub fn is_large(self) -> bool {
        self.0.contains(PageTableFlags::HUGE_PAGE)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
