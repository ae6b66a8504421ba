//! Software emulation of the i386 MMU for testing and development.
//!
//! The page-table layout is identical to the hardware backend; only the way
//! physical memory is reached and the way CR3 and the TLB are driven differ.
//! Physical memory is a vector of pages, and the MMU registers are thread-local
//! so each test thread sees its own machine.

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::{FrameNumber, MemoryMap, Page, PhysicalAddress, PhysicalFrame, PhysicalMemory, VirtualAddress};

std::thread_local! {
    // Not page-aligned, so it never matches a directory before the first load.
    static ACTIVE_ROOT: Cell<u32> = const { Cell::new(u32::MAX) };
    static INVALIDATIONS: RefCell<Vec<VirtualAddress>> = const { RefCell::new(Vec::new()) };
    static ROOT_LOADS: Cell<usize> = const { Cell::new(0) };
}

/// Records a CR3 load.
///
/// # Safety
/// Always safe in emulation; `unsafe` mirrors the hardware signature.
pub unsafe fn load_root(root: PhysicalAddress) {
    ACTIVE_ROOT.with(|r| r.set(root.as_u32()));
    ROOT_LOADS.with(|n| n.set(n.get() + 1));
}

/// Returns the most recently loaded page directory.
pub fn active_root() -> PhysicalAddress {
    PhysicalAddress::new(ACTIVE_ROOT.with(Cell::get))
}

/// Records a single-page TLB invalidation.
pub fn invalidate_page(address: VirtualAddress) {
    INVALIDATIONS.with(|log| log.borrow_mut().push(address));
}

/// Returns and clears the invalidations recorded on this thread.
pub fn take_invalidations() -> Vec<VirtualAddress> {
    INVALIDATIONS.with(|log| core::mem::take(&mut *log.borrow_mut()))
}

/// Returns the number of CR3 loads recorded on this thread.
pub fn root_loads() -> usize {
    ROOT_LOADS.with(Cell::get)
}

/// Emulated physical memory starting at physical address zero.
pub struct EmulatedMemory {
    pages: Vec<Page>,
}

impl EmulatedMemory {
    /// Creates `frames` zeroed frames of physical memory.
    pub fn new(frames: usize) -> Self {
        Self {
            pages: alloc::vec![Page::zeroed(); frames],
        }
    }

    /// Returns a memory map in which every emulated frame is usable.
    pub fn memory_map(&self) -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add_usable(0, (self.pages.len() * crate::PAGE_SIZE) as u64);
        map
    }

    /// Returns the number of emulated frames.
    pub fn frame_count(&self) -> usize {
        self.pages.len()
    }

    /// Returns the frame with the given number.
    pub fn frame(&self, number: u32) -> PhysicalFrame {
        PhysicalFrame::from_number(FrameNumber::new(number))
    }
}

impl PhysicalMemory for EmulatedMemory {
    fn with_page<R>(&mut self, frame: PhysicalFrame, f: impl FnOnce(&mut Page) -> R) -> R {
        let index = frame.number().as_usize();
        let count = self.pages.len();
        let page = self
            .pages
            .get_mut(index)
            .unwrap_or_else(|| panic!("{frame:?} is beyond emulated memory ({count} frames)"));
        f(page)
    }
}
