//! Hardware MMU control for i386.

use core::arch::asm;

use crate::{Page, PhysicalAddress, PhysicalFrame, PhysicalMemory, VirtualAddress};

use super::{PageEntry, PageFlags, PageTable, WINDOW, table_index};

/// Loads a page directory into CR3, flushing every non-global TLB entry.
///
/// # Safety
/// The directory must map the currently executing code, the current stack and
/// every kernel structure reachable from here, at the same addresses as before.
pub unsafe fn load_root(root: PhysicalAddress) {
    // SAFETY: Caller guarantees the directory is a valid continuation of the current one
    unsafe {
        asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack, preserves_flags));
    }
}

/// Returns the physical address of the active page directory.
pub fn active_root() -> PhysicalAddress {
    let value: u32;
    // SAFETY: Reading CR3 has no side effects
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    PhysicalAddress::new(value & 0xFFFF_F000)
}

/// Drops any cached translation for the page containing `address`.
pub fn invalidate_page(address: VirtualAddress) {
    // SAFETY: invlpg only affects the TLB
    unsafe {
        asm!("invlpg [{}]", in(reg) address.as_u32(), options(nostack, preserves_flags));
    }
}

/// Reaches physical memory through a single reserved kernel mapping.
///
/// The window is the last entry of the kernel's first page table. Each access
/// points that entry at the requested frame, invalidates the one stale
/// translation, runs the caller's closure and then puts the previous entry back.
pub struct TemporaryWindow {
    table: *mut PageTable,
}

// SAFETY: There is one CPU and the window is only used under the kernel lock.
unsafe impl Send for TemporaryWindow {}

impl TemporaryWindow {
    /// Creates the window over the given kernel page table.
    ///
    /// # Safety
    /// `table` must be the virtual address of the page table that maps
    /// `0xC000_0000..0xC040_0000` in every address space, and nothing else may use
    /// its last entry.
    pub const unsafe fn new(table: *mut PageTable) -> Self {
        Self { table }
    }
}

impl PhysicalMemory for TemporaryWindow {
    fn with_page<R>(&mut self, frame: PhysicalFrame, f: impl FnOnce(&mut Page) -> R) -> R {
        let window = VirtualAddress::new(WINDOW);
        // SAFETY: The table pointer is valid for the kernel's lifetime and the window
        // entry is reserved for this type.
        let slot = unsafe { (*self.table).entry_mut(table_index(WINDOW)) };
        let previous = *slot;
        *slot = PageEntry::new(frame.start_address(), PageFlags::kernel_data());
        invalidate_page(window);

        // SAFETY: The window now maps exactly `frame`, and the borrow ends before the
        // entry is restored.
        let result = f(unsafe { &mut *window.as_mut_ptr::<Page>() });

        // SAFETY: As above.
        unsafe {
            *(*self.table).entry_mut(table_index(WINDOW)) = previous;
        }
        invalidate_page(window);
        result
    }
}
