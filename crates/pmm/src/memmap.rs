//! Boot-time description of usable physical memory.
//!
//! The memory map is an ordered list of disjoint usable frame ranges. It is built
//! once from the bootloader's map and then narrowed with [`MemoryMap::reserve`] to
//! exclude the kernel image, boot data and anything else the allocator must never
//! hand out. The [`FrameAllocator`](crate::FrameAllocator) is built from the result.
//!
//! # Building a Memory Map
//!
//! To build a memory map, implement the [`BootMemoryRegion`] trait on your bootloader's
//! memory map entry type, then call [`MemoryMap::from_boot_map`]:
//!
//! ```ignore
//! struct MyBootEntry { /* ... */ }
//!
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> u64 { /* ... */ }
//!     fn size(&self) -> u64 { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//!
//! let boot_entries: &[MyBootEntry] = /* ... */;
//! let mut memory_map = MemoryMap::from_boot_map(boot_entries);
//! memory_map.reserve(kernel_start, kernel_size);
//! ```

use alloc::vec::Vec;
use core::fmt;

use crate::{FrameNumber, PhysicalAddress, arch};

/// One past the highest physical address reachable without PAE.
const ADDRESS_LIMIT: u64 = 1 << 32;

/// Represents a single entry in a boot-time memory map.
///
/// Implement this trait on bootloader-specific memory map entry types
/// to allow pmm to build its internal memory map from the boot map.
/// Bases and sizes are 64-bit because firmware reports memory above 4 GiB;
/// that memory is ignored.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> u64;

    /// Returns the size of this region in bytes.
    fn size(&self) -> u64;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (reserved, ACPI, device memory, etc.) should
    /// return `false`.
    fn is_usable(&self) -> bool;
}

/// A half-open range of frame numbers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: FrameNumber,
    pub end: FrameNumber,
}

impl FrameRange {
    pub const fn new(start: FrameNumber, end: FrameNumber) -> Self {
        Self { start, end }
    }

    /// Number of frames in the range.
    pub const fn len(&self) -> u32 {
        self.end.as_u32().saturating_sub(self.start.as_u32())
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.start && frame < self.end
    }
}

impl fmt::Debug for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x}..{:#010x}",
            self.start.start().as_u32() as u64,
            self.end.as_u32() as u64 * arch::PAGE_SIZE as u64
        )
    }
}

/// The set of physical frames the kernel may allocate.
#[derive(Debug, Default, Clone)]
pub struct MemoryMap {
    usable: Vec<FrameRange>,
}

impl MemoryMap {
    /// Creates an empty memory map.
    pub const fn new() -> Self {
        Self { usable: Vec::new() }
    }

    /// Constructs a memory map from a boot-time memory map.
    ///
    /// Usable regions are shrunk inward to whole frames. Non-usable regions are
    /// rounded outward and always win over usable ones, regardless of the order
    /// the bootloader lists them in.
    pub fn from_boot_map<R: BootMemoryRegion>(boot_map: &[R]) -> Self {
        let mut map = Self::new();

        for region in boot_map.iter().filter(|r| r.is_usable()) {
            map.add_usable(region.base(), region.size());
        }

        for region in boot_map.iter().filter(|r| !r.is_usable()) {
            map.reserve_range(region.base(), region.size());
        }

        log::trace!(
            "memory map built from {} boot entries: {} usable frames in {} ranges",
            boot_map.len(),
            map.usable_frame_count(),
            map.usable.len()
        );

        map
    }

    /// Marks `[base, base + size)` as usable.
    pub fn add_usable(&mut self, base: u64, size: u64) {
        let page = arch::PAGE_SIZE as u64;
        let start = base.div_ceil(page);
        let end = base.saturating_add(size).min(ADDRESS_LIMIT) / page;
        if start >= end {
            return;
        }

        self.usable.push(FrameRange::new(
            FrameNumber::new(start as u32),
            FrameNumber::new(end as u32),
        ));
        self.normalize();
    }

    /// Removes `[base, base + size)` from the usable set.
    ///
    /// Partial frames at either end are removed entirely.
    pub fn reserve(&mut self, base: PhysicalAddress, size: u32) {
        self.reserve_range(base.as_u32() as u64, size as u64);
    }

    fn reserve_range(&mut self, base: u64, size: u64) {
        if size == 0 || base >= ADDRESS_LIMIT {
            return;
        }

        let page = arch::PAGE_SIZE as u64;
        let start = FrameNumber::new((base / page) as u32);
        let end_frame = base.saturating_add(size).min(ADDRESS_LIMIT).div_ceil(page);
        let end = FrameNumber::new(end_frame as u32);

        let mut remaining = Vec::with_capacity(self.usable.len() + 1);
        for range in self.usable.drain(..) {
            if range.end <= start || range.start >= end {
                remaining.push(range);
                continue;
            }
            if range.start < start {
                remaining.push(FrameRange::new(range.start, start));
            }
            if range.end > end {
                remaining.push(FrameRange::new(end, range.end));
            }
        }
        self.usable = remaining;
    }

    /// Sorts and merges overlapping or adjacent ranges.
    fn normalize(&mut self) {
        self.usable.sort_by_key(|r| r.start);

        let mut merged: Vec<FrameRange> = Vec::with_capacity(self.usable.len());
        for range in self.usable.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    if range.end > last.end {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }
        self.usable = merged;
    }

    /// Returns the usable ranges in ascending order.
    pub fn usable_ranges(&self) -> &[FrameRange] {
        &self.usable
    }

    /// Returns one past the highest usable frame number, or zero if nothing is usable.
    pub fn frame_limit(&self) -> FrameNumber {
        self.usable
            .last()
            .map(|r| r.end)
            .unwrap_or(FrameNumber::new(0))
    }

    /// Returns the total number of usable frames.
    pub fn usable_frame_count(&self) -> usize {
        self.usable.iter().map(|r| r.len() as usize).sum()
    }

    /// Returns true if the frame is usable.
    pub fn is_usable(&self, frame: FrameNumber) -> bool {
        self.usable.iter().any(|r| r.contains(frame))
    }
}
