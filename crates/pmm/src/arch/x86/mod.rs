//! i386 paging layout.
//!
//! Two-level paging without PAE: a 32-bit linear address splits 10/10/12 into a
//! page directory index, a page table index and a byte offset. This layout is
//! used unchanged by both the hardware and the software backend.

mod entry;
mod flags;
#[cfg(all(
    target_arch = "x86",
    target_os = "none",
    not(test),
    not(feature = "software-emulation")
))]
mod mmu;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
#[cfg(all(
    target_arch = "x86",
    target_os = "none",
    not(test),
    not(feature = "software-emulation")
))]
pub use mmu::*;
pub use table::PageTable;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a page directory or page table.
pub const ENTRY_COUNT: usize = 1024;

/// Start of the kernel half of every address space.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// First page directory index belonging to the kernel half.
pub const KERNEL_DIRECTORY_INDEX: usize = directory_index(KERNEL_BASE);

/// Bytes mapped by one page directory entry (4 MiB).
pub const TABLE_SPAN: u32 = (ENTRY_COUNT * PAGE_SIZE) as u32;

/// Virtual address of the temporary mapping window: the last page covered by
/// the kernel's first page table.
pub const WINDOW: u32 = KERNEL_BASE + TABLE_SPAN - PAGE_SIZE as u32;

/// Returns the page directory index for a linear address (bits 22-31).
#[inline]
pub const fn directory_index(address: u32) -> usize {
    (address >> 22) as usize
}

/// Returns the page table index for a linear address (bits 12-21).
#[inline]
pub const fn table_index(address: u32) -> usize {
    ((address >> PAGE_SHIFT) & 0x3FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_half_starts_at_directory_768() {
        assert_eq!(KERNEL_DIRECTORY_INDEX, 768);
    }

    #[test]
    fn window_is_last_entry_of_first_kernel_table() {
        assert_eq!(WINDOW, 0xC03F_F000);
        assert_eq!(directory_index(WINDOW), KERNEL_DIRECTORY_INDEX);
        assert_eq!(table_index(WINDOW), ENTRY_COUNT - 1);
    }
}
