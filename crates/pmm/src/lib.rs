#![cfg_attr(
    all(
        target_arch = "x86",
        target_os = "none",
        not(test),
        not(feature = "software-emulation")
    ),
    no_std
)]

//! # Ringlet Paging Memory Manager (PMM)
//!
//! The paging memory manager is the memory layer of the Ringlet kernel. It provides:
//!
//! - Distinct physical and virtual address types with no implicit conversion.
//! - A boot memory map and a bitmap allocator over 4 KiB physical frames.
//! - i386 two-level page directories, and per-process address spaces built on them.
//! - Software emulation of physical memory and the MMU for testing in non-kernel
//!   environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod frame;
mod frame_allocator;
mod memmap;
mod numbers;
mod page_directory;
mod physical_memory;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use frame::PhysicalFrame;
pub use frame_allocator::{AllocError, FrameAllocator};
pub use memmap::{BootMemoryRegion, FrameRange, MemoryMap};
pub use numbers::FrameNumber;
pub use page_directory::{AccessKind, Mapping, PageDirectory, PageFault};
pub use physical_memory::{Page, PhysicalMemory};

pub use arch::{
    ENTRY_COUNT, KERNEL_BASE, PAGE_SIZE, PageEntry, PageFlags, PageTable, TABLE_SPAN, WINDOW,
    active_root, invalidate_page,
};

#[cfg(all(
    target_arch = "x86",
    target_os = "none",
    not(test),
    not(feature = "software-emulation")
))]
pub use arch::TemporaryWindow;

#[cfg(any(
    test,
    feature = "software-emulation",
    not(target_arch = "x86"),
    not(target_os = "none")
))]
pub use arch::{EmulatedMemory, root_loads, take_invalidations};
