//! Page table structure for i386.

use super::{ENTRY_COUNT, entry::PageEntry};

/// One level of the i386 two-level paging structure.
///
/// A page directory and a page table have the same shape: 1024 32-bit entries
/// filling exactly one 4 KiB frame. Apart from the statically allocated boot
/// tables, a table is a view over a frame obtained through
/// [`Page::as_table_mut`](crate::Page::as_table_mut).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// A table with no present entries.
    pub const EMPTY: Self = Self {
        entries: [PageEntry::EMPTY; ENTRY_COUNT],
    };

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns an iterator over `(index, entry)` pairs of present entries.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }

    /// Clears every entry.
    pub fn clear(&mut self) {
        self.entries.fill(PageEntry::default());
    }
}

const _: () = assert!(core::mem::size_of::<PageTable>() == super::PAGE_SIZE);
