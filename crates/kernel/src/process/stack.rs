//! Per-process kernel stacks.
//!
//! Every process owns one slot in a fixed kernel area. A slot is an unmapped
//! guard page followed by the stack pages, so running off the bottom of a
//! stack faults instead of corrupting the slot below.

use alloc::vec::Vec;

use pmm::{PAGE_SIZE, PhysicalMemory, VirtualAddress};

use super::ProcessError;
use crate::mem::KernelMemory;

/// Start of the kernel stack area.
pub const STACK_AREA_BASE: VirtualAddress = VirtualAddress::new(0xE000_0000);

/// A mapped kernel stack.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    slot: usize,
    bottom: VirtualAddress,
    pages: usize,
}

impl KernelStack {
    /// The lowest mapped address.
    pub fn bottom(&self) -> VirtualAddress {
        self.bottom
    }

    /// The first address above the stack; the initial ESP.
    pub fn top(&self) -> VirtualAddress {
        self.bottom + (self.pages * PAGE_SIZE) as u32
    }

    /// The unmapped page below the stack.
    pub fn guard(&self) -> VirtualAddress {
        self.bottom - PAGE_SIZE as u32
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.bottom && address <= self.top()
    }

    fn pages(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        (0..self.pages).map(|i| self.bottom + (i * PAGE_SIZE) as u32)
    }
}

/// The slots of the kernel stack area and the stacks waiting to be freed.
#[derive(Debug)]
pub struct KernelStackArea {
    pages: usize,
    free: Vec<usize>,
    retired: Vec<KernelStack>,
}

impl KernelStackArea {
    /// Lays out `slots` stacks of `pages` pages each and creates the page
    /// tables that will map them.
    pub fn new<M: PhysicalMemory>(
        memory: &mut KernelMemory<M>,
        pages: usize,
        slots: usize,
    ) -> Result<Self, ProcessError> {
        let slot_size = (pages + 1) * PAGE_SIZE;
        memory.reserve_tables(STACK_AREA_BASE, (slot_size * slots) as u32)?;
        log::debug!(
            "kernel stack area: {slots} slots of {pages} pages at {STACK_AREA_BASE}"
        );
        Ok(Self {
            pages,
            free: (0..slots).rev().collect(),
            retired: Vec::new(),
        })
    }

    fn slot_base(&self, slot: usize) -> VirtualAddress {
        STACK_AREA_BASE + (slot * (self.pages + 1) * PAGE_SIZE) as u32
    }

    /// Maps a fresh zeroed stack in the lowest free slot.
    pub fn allocate<M: PhysicalMemory>(
        &mut self,
        memory: &mut KernelMemory<M>,
    ) -> Result<KernelStack, ProcessError> {
        let slot = self.free.pop().ok_or(ProcessError::TableFull)?;
        let stack = KernelStack {
            slot,
            bottom: self.slot_base(slot) + PAGE_SIZE as u32,
            pages: self.pages,
        };
        for (mapped, page) in stack.pages().enumerate() {
            if let Err(err) = memory.map_kernel_page(page) {
                for page in stack.pages().take(mapped) {
                    memory.unmap_kernel_page(page);
                }
                self.free.push(slot);
                return Err(err.into());
            }
        }
        Ok(stack)
    }

    /// Unmaps `stack` and returns its frames and slot.
    ///
    /// The caller must not be running on it.
    pub fn free<M: PhysicalMemory>(&mut self, memory: &mut KernelMemory<M>, stack: KernelStack) {
        for page in stack.pages() {
            memory.unmap_kernel_page(page);
        }
        self.free.push(stack.slot);
    }

    /// Parks a stack that is still in use until [`KernelStackArea::drain_retired`].
    pub fn retire(&mut self, stack: KernelStack) {
        log::trace!("retiring kernel stack at {}", stack.bottom);
        self.retired.push(stack);
    }

    /// Frees every retired stack. Returns how many were freed.
    pub fn drain_retired<M: PhysicalMemory>(&mut self, memory: &mut KernelMemory<M>) -> usize {
        let retired = core::mem::take(&mut self.retired);
        let count = retired.len();
        for stack in retired {
            self.free(memory, stack);
        }
        count
    }

    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}
