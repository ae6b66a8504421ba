//! Two-level page table management.
//!
//! A [`PageDirectory`] is a handle to the physical frame holding an i386 page
//! directory. Page tables hang off it by physical address; every walk goes
//! through a [`PhysicalMemory`] so no table ever needs to be mapped into the
//! active address space in order to be edited.

use alloc::vec::Vec;

use x86_64::{PrivilegeLevel, structures::idt::PageFaultErrorCode};

use crate::{
    AllocError, FrameAllocator, PhysicalAddress, PhysicalFrame, PhysicalMemory, VirtualAddress,
    arch::{self, ENTRY_COUNT, KERNEL_DIRECTORY_INDEX, PageEntry, PageFlags},
};

/// The kind of memory access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// A page fault the MMU would raise for an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting linear address (what the CPU reports in CR2).
    pub address: VirtualAddress,
    /// The error code the CPU would push.
    pub error: PageFaultErrorCode,
}

impl PageFault {
    /// Returns true if the page was present and the access broke its protection.
    pub fn is_protection_violation(&self) -> bool {
        self.error.contains(PageFaultErrorCode::PROTECTION_VIOLATION)
    }
}

/// One present leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub page: VirtualAddress,
    pub frame: PhysicalFrame,
    pub flags: PageFlags,
}

/// An i386 page directory, identified by the frame that holds it.
///
/// The handle does not free anything on drop; [`PageDirectory::release`] returns
/// its frames explicitly.
#[derive(Debug, PartialEq, Eq)]
pub struct PageDirectory {
    root: PhysicalFrame,
}

impl PageDirectory {
    /// Allocates an empty page directory.
    pub fn new<M: PhysicalMemory>(
        memory: &mut M,
        frames: &mut FrameAllocator,
    ) -> Result<Self, AllocError> {
        let root = frames.allocate_frame()?;
        memory.zero_frame(root);
        Ok(Self { root })
    }

    /// Allocates a directory whose kernel half points at the same page tables as
    /// `kernel`, so kernel mappings are visible from it without a switch.
    pub fn new_sharing_kernel<M: PhysicalMemory>(
        kernel: &PageDirectory,
        memory: &mut M,
        frames: &mut FrameAllocator,
    ) -> Result<Self, AllocError> {
        let directory = Self::new(memory, frames)?;

        let mut shared = [PageEntry::default(); ENTRY_COUNT - KERNEL_DIRECTORY_INDEX];
        memory.with_page(kernel.root, |page| {
            let table = page.as_table();
            for (i, entry) in shared.iter_mut().enumerate() {
                *entry = table.entry(KERNEL_DIRECTORY_INDEX + i);
            }
        });
        memory.with_page(directory.root, |page| {
            let table = page.as_table_mut();
            for (i, entry) in shared.iter().enumerate() {
                *table.entry_mut(KERNEL_DIRECTORY_INDEX + i) = *entry;
            }
        });

        Ok(directory)
    }

    /// Adopts an existing directory, such as the one built by the boot code.
    pub const fn from_root(root: PhysicalFrame) -> Self {
        Self { root }
    }

    /// Returns the frame holding the directory.
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// Returns true if this directory is loaded in CR3.
    pub fn is_active(&self) -> bool {
        arch::active_root() == self.root.start_address()
    }

    /// Loads this directory into the page-table-base register.
    ///
    /// This implicitly discards every non-global cached translation.
    ///
    /// # Safety
    /// The directory must map the running kernel at the same addresses as the
    /// currently active one.
    pub unsafe fn switch_to(&self) {
        log::trace!("switching to page directory {:?}", self.root);
        // SAFETY: Caller guarantees the kernel half is shared.
        unsafe { arch::load_root(self.root.start_address()) }
    }

    fn directory_entry<M: PhysicalMemory>(&self, memory: &mut M, virt: VirtualAddress) -> PageEntry {
        memory.with_page(self.root, |page| page.as_table().entry(virt.directory_index()))
    }

    /// Returns the page table covering `virt`, allocating and linking an empty one if
    /// the directory entry is absent.
    pub fn ensure_table<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        frames: &mut FrameAllocator,
        virt: VirtualAddress,
    ) -> Result<PhysicalFrame, AllocError> {
        if let Some(address) = self.directory_entry(memory, virt).address() {
            return Ok(PhysicalFrame::containing(address));
        }

        let table = frames.allocate_frame()?;
        memory.zero_frame(table);

        // Leaf entries carry the real permissions; directory entries in the user
        // half are left permissive.
        let flags = if virt.is_kernel() {
            PageFlags::kernel_data()
        } else {
            PageFlags::user_data()
        };
        memory.with_page(self.root, |page| {
            *page.as_table_mut().entry_mut(virt.directory_index()) =
                PageEntry::new(table.start_address(), flags);
        });

        if virt.is_kernel() {
            log::debug!(
                "new kernel page table {:?} for {} in {:?}",
                table,
                virt.align_down(arch::TABLE_SPAN),
                self.root
            );
        }
        Ok(table)
    }

    /// Maps the page at `virt` to `frame`.
    ///
    /// Returns the frame that was previously mapped there, if any. A stale
    /// translation is invalidated when the old mapping differed and the
    /// translation can be cached (the directory is active or the page is in the
    /// shared kernel half).
    ///
    /// # Panics
    /// Panics if `virt` is not page-aligned.
    pub fn map<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        frames: &mut FrameAllocator,
        virt: VirtualAddress,
        frame: PhysicalFrame,
        flags: PageFlags,
    ) -> Result<Option<PhysicalFrame>, AllocError> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE as u32),
            "virtual address must be page-aligned"
        );

        let table = self.ensure_table(memory, frames, virt)?;
        let mut flags = flags;
        flags.set_present(true);
        let entry = PageEntry::new(frame.start_address(), flags);

        let previous = memory.with_page(table, |page| {
            core::mem::replace(page.as_table_mut().entry_mut(virt.table_index()), entry)
        });

        if previous.is_present() && previous != entry {
            self.invalidate(virt);
        }
        Ok(previous.address().map(PhysicalFrame::containing))
    }

    /// Removes the mapping for the page at `virt`, returning the frame it pointed to.
    ///
    /// # Panics
    /// Panics if `virt` is not page-aligned.
    pub fn unmap<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        virt: VirtualAddress,
    ) -> Option<PhysicalFrame> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE as u32),
            "virtual address must be page-aligned"
        );

        let table = PhysicalFrame::containing(self.directory_entry(memory, virt).address()?);
        let previous = memory.with_page(table, |page| {
            core::mem::take(page.as_table_mut().entry_mut(virt.table_index()))
        });

        let frame = previous.address().map(PhysicalFrame::containing)?;
        self.invalidate(virt);
        Some(frame)
    }

    fn invalidate(&self, virt: VirtualAddress) {
        if virt.is_kernel() || self.is_active() {
            arch::invalidate_page(virt);
        }
    }

    /// Returns the leaf entry for `virt`, if its page table exists.
    pub fn entry<M: PhysicalMemory>(&self, memory: &mut M, virt: VirtualAddress) -> Option<PageEntry> {
        let table = PhysicalFrame::containing(self.directory_entry(memory, virt).address()?);
        Some(memory.with_page(table, |page| page.as_table().entry(virt.table_index())))
    }

    /// Walks the tables for `virt` without side effects.
    pub fn translate<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let frame = self.entry(memory, virt)?.address()?;
        Some(frame + virt.page_offset())
    }

    /// Applies the i386 protection rules to an access at `virt` made at `privilege`.
    ///
    /// User-mode (ring 3) accesses need the user bit on both levels, and writes
    /// also need the writable bit on both levels. Supervisor accesses only need
    /// the page to be present (CR0.WP is clear).
    pub fn check_access<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        virt: VirtualAddress,
        access: AccessKind,
        privilege: PrivilegeLevel,
    ) -> Result<PhysicalAddress, PageFault> {
        let user = privilege == PrivilegeLevel::Ring3;
        let mut error = PageFaultErrorCode::empty();
        error.set(PageFaultErrorCode::CAUSED_BY_WRITE, access == AccessKind::Write);
        error.set(PageFaultErrorCode::USER_MODE, user);

        let not_present = PageFault {
            address: virt,
            error,
        };

        let directory_entry = self.directory_entry(memory, virt);
        let Some(table) = directory_entry.address() else {
            return Err(not_present);
        };
        let leaf = memory.with_page(PhysicalFrame::containing(table), |page| {
            page.as_table().entry(virt.table_index())
        });
        let Some(frame) = leaf.address() else {
            return Err(not_present);
        };

        if user {
            let (upper, lower) = (directory_entry.flags(), leaf.flags());
            let visible = upper.is_user() && lower.is_user();
            let writable = upper.is_writable() && lower.is_writable();
            if !visible || (access == AccessKind::Write && !writable) {
                return Err(PageFault {
                    address: virt,
                    error: error | PageFaultErrorCode::PROTECTION_VIOLATION,
                });
            }
        }

        Ok(frame + virt.page_offset())
    }

    /// Returns every present leaf mapping in the user half.
    pub fn user_mappings<M: PhysicalMemory>(&self, memory: &mut M) -> Vec<Mapping> {
        let mut mappings = Vec::new();
        for (directory_index, table) in self.user_tables(memory) {
            memory.with_page(table, |page| {
                for (table_index, entry) in page.as_table().present_entries() {
                    let start = ((directory_index << 22) | (table_index << 12)) as u32;
                    if let Some(address) = entry.address() {
                        mappings.push(Mapping {
                            page: VirtualAddress::new(start),
                            frame: PhysicalFrame::containing(address),
                            flags: entry.flags(),
                        });
                    }
                }
            });
        }
        mappings
    }

    /// Returns `(directory index, table frame)` for every page table in the user half.
    pub fn user_tables<M: PhysicalMemory>(&self, memory: &mut M) -> Vec<(usize, PhysicalFrame)> {
        memory.with_page(self.root, |page| {
            page.as_table()
                .present_entries()
                .take_while(|(index, _)| *index < KERNEL_DIRECTORY_INDEX)
                .filter_map(|(index, entry)| {
                    entry.address().map(|a| (index, PhysicalFrame::containing(a)))
                })
                .collect()
        })
    }

    /// Frees the directory frame and every user-half page table.
    ///
    /// Frames mapped by those tables are not touched; the caller must have
    /// returned them already. Kernel-half tables are shared and are never freed.
    pub fn release<M: PhysicalMemory>(self, memory: &mut M, frames: &mut FrameAllocator) {
        debug_assert!(!self.is_active(), "releasing the active page directory");

        for (_, table) in self.user_tables(memory) {
            frames.free_frame(table);
        }
        frames.free_frame(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMemory, arch::take_invalidations};

    struct Machine {
        memory: EmulatedMemory,
        frames: FrameAllocator,
    }

    fn machine(frames: usize) -> Machine {
        let memory = EmulatedMemory::new(frames);
        let frames = FrameAllocator::new(&memory.memory_map());
        take_invalidations();
        Machine { memory, frames }
    }

    impl Machine {
        fn directory(&mut self) -> PageDirectory {
            PageDirectory::new(&mut self.memory, &mut self.frames).expect("directory")
        }

        fn frame(&mut self) -> PhysicalFrame {
            self.frames.allocate_frame().expect("frame")
        }
    }

    #[test]
    fn translate_mapped_and_unmapped_addresses() {
        let mut m = machine(64);
        let mut dir = m.directory();
        let mut backing = Vec::new();

        for i in 0..8u32 {
            let page = VirtualAddress::new(0x0040_0000 + i * 0x1000);
            let frame = m.frame();
            dir.map(&mut m.memory, &mut m.frames, page, frame, PageFlags::user_data())
                .expect("map");
            backing.push((page, frame));
        }

        for (page, frame) in &backing {
            for offset in [0u32, 1, 0x7FF, 0xFFF] {
                let virt = *page + offset;
                assert_eq!(
                    dir.translate(&mut m.memory, virt),
                    Some(frame.start_address() + offset)
                );
            }
        }

        for unmapped in [0u32, 0x003F_F000, 0x0040_8000, 0x0080_0000, 0xC000_0000] {
            assert_eq!(dir.translate(&mut m.memory, VirtualAddress::new(unmapped)), None);
        }
    }

    #[test]
    fn map_allocates_one_table_per_4mib() {
        let mut m = machine(32);
        let mut dir = m.directory();
        let before = m.frames.free_frames();

        let a = m.frame();
        let b = m.frame();
        dir.map(&mut m.memory, &mut m.frames, VirtualAddress::new(0x1000), a, PageFlags::user_data())
            .expect("map");
        dir.map(&mut m.memory, &mut m.frames, VirtualAddress::new(0x3F_F000), b, PageFlags::user_data())
            .expect("map");

        // two data frames and one shared table
        assert_eq!(before - m.frames.free_frames(), 3);
        assert_eq!(dir.user_tables(&mut m.memory).len(), 1);
    }

    #[test]
    fn unmap_returns_frame_and_clears_translation() {
        let mut m = machine(16);
        let mut dir = m.directory();
        let frame = m.frame();
        let page = VirtualAddress::new(0x0800_0000);

        dir.map(&mut m.memory, &mut m.frames, page, frame, PageFlags::user_data())
            .expect("map");
        assert_eq!(dir.unmap(&mut m.memory, page), Some(frame));
        assert_eq!(dir.translate(&mut m.memory, page), None);
        assert_eq!(dir.unmap(&mut m.memory, page), None);
        assert_eq!(dir.unmap(&mut m.memory, VirtualAddress::new(0x4000_0000)), None);
    }

    #[test]
    fn remapping_active_directory_invalidates_stale_translation() {
        let mut m = machine(16);
        let mut dir = m.directory();
        let (first, second) = (m.frame(), m.frame());
        let page = VirtualAddress::new(0x0040_0000);

        unsafe { dir.switch_to() };
        assert!(dir.is_active());

        dir.map(&mut m.memory, &mut m.frames, page, first, PageFlags::user_data())
            .expect("map");
        assert!(take_invalidations().is_empty(), "fresh mapping needs no flush");

        let previous = dir
            .map(&mut m.memory, &mut m.frames, page, second, PageFlags::user_data())
            .expect("remap");
        assert_eq!(previous, Some(first));
        assert_eq!(take_invalidations(), [page]);

        dir.map(&mut m.memory, &mut m.frames, page, second, PageFlags::user_data())
            .expect("identical remap");
        assert!(take_invalidations().is_empty(), "identical mapping needs no flush");

        dir.unmap(&mut m.memory, page);
        assert_eq!(take_invalidations(), [page]);
    }

    #[test]
    fn inactive_user_mappings_are_not_invalidated() {
        let mut m = machine(16);
        let active = m.directory();
        let mut inactive = m.directory();
        unsafe { active.switch_to() };
        let (first, second) = (m.frame(), m.frame());
        let page = VirtualAddress::new(0x0040_0000);

        inactive
            .map(&mut m.memory, &mut m.frames, page, first, PageFlags::user_data())
            .expect("map");
        inactive
            .map(&mut m.memory, &mut m.frames, page, second, PageFlags::user_data())
            .expect("remap");
        assert!(take_invalidations().is_empty());

        // Kernel-half pages may be cached from any directory.
        let kernel_page = VirtualAddress::new(0xE000_0000);
        inactive
            .map(&mut m.memory, &mut m.frames, kernel_page, first, PageFlags::kernel_data())
            .expect("map");
        inactive.unmap(&mut m.memory, kernel_page);
        assert_eq!(take_invalidations(), [kernel_page]);
    }

    #[test]
    fn kernel_half_is_shared() {
        let mut m = machine(32);
        let mut kernel = m.directory();
        let heap = m.frame();
        kernel
            .map(&mut m.memory, &mut m.frames, VirtualAddress::new(0xC010_0000), heap, PageFlags::kernel_data())
            .expect("map");

        let process = PageDirectory::new_sharing_kernel(&kernel, &mut m.memory, &mut m.frames)
            .expect("directory");
        assert_eq!(
            process.translate(&mut m.memory, VirtualAddress::new(0xC010_0123)),
            Some(heap.start_address() + 0x123)
        );

        // A later mapping through an existing kernel table shows up everywhere.
        let late = m.frame();
        kernel
            .map(&mut m.memory, &mut m.frames, VirtualAddress::new(0xC020_0000), late, PageFlags::kernel_data())
            .expect("map");
        assert_eq!(
            process.translate(&mut m.memory, VirtualAddress::new(0xC020_0000)),
            Some(late.start_address())
        );
        assert!(process.user_tables(&mut m.memory).is_empty());
    }

    #[test]
    fn user_write_to_read_only_page_faults() {
        let mut m = machine(16);
        let mut dir = m.directory();
        let frame = m.frame();
        let zero = VirtualAddress::new(0);

        dir.map(&mut m.memory, &mut m.frames, zero, frame, PageFlags::new(false, true))
            .expect("map");

        let fault = dir
            .check_access(&mut m.memory, zero, AccessKind::Write, PrivilegeLevel::Ring3)
            .expect_err("read-only page must fault");
        assert_eq!(fault.address, zero);
        assert!(fault.is_protection_violation());
        assert!(fault.error.contains(PageFaultErrorCode::CAUSED_BY_WRITE));
        assert!(fault.error.contains(PageFaultErrorCode::USER_MODE));

        assert_eq!(
            dir.check_access(&mut m.memory, zero, AccessKind::Read, PrivilegeLevel::Ring3),
            Ok(frame.start_address())
        );

        dir.map(&mut m.memory, &mut m.frames, zero, frame, PageFlags::new(true, true))
            .expect("remap writable");
        assert_eq!(
            dir.check_access(&mut m.memory, zero + 4, AccessKind::Write, PrivilegeLevel::Ring3),
            Ok(frame.start_address() + 4)
        );
    }

    #[test]
    fn user_access_to_supervisor_page_faults() {
        let mut m = machine(16);
        let mut dir = m.directory();
        let frame = m.frame();
        let page = VirtualAddress::new(0x0010_0000);
        dir.map(&mut m.memory, &mut m.frames, page, frame, PageFlags::kernel_data())
            .expect("map");

        for access in [AccessKind::Read, AccessKind::Write] {
            let fault = dir
                .check_access(&mut m.memory, page, access, PrivilegeLevel::Ring3)
                .expect_err("supervisor page");
            assert!(fault.is_protection_violation());
        }
        assert!(dir
            .check_access(&mut m.memory, page, AccessKind::Write, PrivilegeLevel::Ring0)
            .is_ok());
    }

    #[test]
    fn unmapped_access_faults_as_not_present() {
        let mut m = machine(8);
        let dir = m.directory();

        let fault = dir
            .check_access(&mut m.memory, VirtualAddress::new(0x1234), AccessKind::Read, PrivilegeLevel::Ring0)
            .expect_err("nothing mapped");
        assert!(!fault.is_protection_violation());
        assert_eq!(fault.error, PageFaultErrorCode::empty());
    }

    #[test]
    fn release_returns_directory_and_tables() {
        let mut m = machine(16);
        let before = m.frames.free_frames();
        let mut dir = m.directory();
        let frame = m.frame();
        dir.map(&mut m.memory, &mut m.frames, VirtualAddress::new(0x1000), frame, PageFlags::user_data())
            .expect("map");
        dir.map(&mut m.memory, &mut m.frames, VirtualAddress::new(0x0100_0000), frame, PageFlags::user_data())
            .expect("map");

        dir.release(&mut m.memory, &mut m.frames);
        m.frames.free_frame(frame);
        assert_eq!(m.frames.free_frames(), before);
    }

    #[test]
    fn out_of_memory_while_creating_table() {
        let mut m = machine(2);
        let mut dir = m.directory();
        let frame = m.frame();
        assert_eq!(
            dir.map(&mut m.memory, &mut m.frames, VirtualAddress::new(0x1000), frame, PageFlags::user_data()),
            Err(AllocError::OutOfMemory)
        );
    }
}
