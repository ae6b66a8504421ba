//! Process address spaces.
//!
//! An [`AddressSpace`] owns a page directory whose kernel half is shared with
//! the kernel directory, and owns every frame mapped in its user half along with
//! the page tables that map them.

use x86_64::{PrivilegeLevel, structures::idt::PageFaultErrorCode};

use crate::{
    AccessKind, AllocError, FrameAllocator, PAGE_SIZE, PageDirectory, PageFault, PageFlags,
    PhysicalFrame, PhysicalMemory, VirtualAddress,
};

/// A user address space.
///
/// Dropping an address space leaks its frames; call [`AddressSpace::destroy`].
#[derive(Debug)]
pub struct AddressSpace {
    directory: PageDirectory,
}

impl AddressSpace {
    /// Creates an address space with an empty user half.
    pub fn new<M: PhysicalMemory>(
        kernel: &PageDirectory,
        memory: &mut M,
        frames: &mut FrameAllocator,
    ) -> Result<Self, AllocError> {
        let directory = PageDirectory::new_sharing_kernel(kernel, memory, frames)?;
        Ok(Self { directory })
    }

    /// Returns the page directory backing this address space.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// Returns true if this address space is loaded.
    pub fn is_active(&self) -> bool {
        self.directory.is_active()
    }

    /// Makes this the active address space.
    ///
    /// # Safety
    /// See [`PageDirectory::switch_to`].
    pub unsafe fn switch_to(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.directory.switch_to() }
    }

    /// Maps a freshly allocated, zeroed frame at `page`.
    ///
    /// A frame previously mapped at `page` is freed.
    pub fn map_fresh<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        frames: &mut FrameAllocator,
        page: VirtualAddress,
        flags: PageFlags,
    ) -> Result<PhysicalFrame, AllocError> {
        debug_assert!(!page.is_kernel(), "user address space mapping kernel page {page}");

        let frame = frames.allocate_frame()?;
        memory.zero_frame(frame);
        match self.directory.map(memory, frames, page, frame, flags) {
            Ok(Some(previous)) => {
                frames.free_frame(previous);
                Ok(frame)
            }
            Ok(None) => Ok(frame),
            Err(err) => {
                frames.free_frame(frame);
                Err(err)
            }
        }
    }

    /// Maps `count` fresh pages starting at `start`.
    ///
    /// On failure, pages mapped so far stay mapped and are reclaimed by
    /// [`AddressSpace::destroy`].
    pub fn map_range_fresh<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        frames: &mut FrameAllocator,
        start: VirtualAddress,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), AllocError> {
        for i in 0..count {
            self.map_fresh(memory, frames, start + (i * PAGE_SIZE) as u32, flags)?;
        }
        Ok(())
    }

    /// Removes the mapping at `page` and frees the frame behind it.
    pub fn unmap<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        frames: &mut FrameAllocator,
        page: VirtualAddress,
    ) -> bool {
        match self.directory.unmap(memory, page) {
            Some(frame) => {
                frames.free_frame(frame);
                true
            }
            None => false,
        }
    }

    /// Copies `bytes` into this address space at `address`, honouring the page
    /// protections that apply at `privilege`.
    ///
    /// Nothing is written if any page in the range would fault.
    pub fn copy_to<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        address: VirtualAddress,
        bytes: &[u8],
        privilege: PrivilegeLevel,
    ) -> Result<(), PageFault> {
        self.check_range(memory, address, bytes.len(), AccessKind::Write, privilege)?;

        let mut done = 0;
        while done < bytes.len() {
            let virt = address + done as u32;
            let count = (PAGE_SIZE - virt.page_offset() as usize).min(bytes.len() - done);
            let physical = self
                .directory
                .check_access(memory, virt, AccessKind::Write, privilege)?;
            memory.write(physical, &bytes[done..done + count]);
            done += count;
        }
        Ok(())
    }

    /// Copies bytes out of this address space at `address` into `buf`.
    pub fn copy_from<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        address: VirtualAddress,
        buf: &mut [u8],
        privilege: PrivilegeLevel,
    ) -> Result<(), PageFault> {
        let mut done = 0;
        while done < buf.len() {
            let virt = address + done as u32;
            let count = (PAGE_SIZE - virt.page_offset() as usize).min(buf.len() - done);
            let physical = self
                .directory
                .check_access(memory, virt, AccessKind::Read, privilege)?;
            memory.read(physical, &mut buf[done..done + count]);
            done += count;
        }
        Ok(())
    }

    fn check_range<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        address: VirtualAddress,
        len: usize,
        access: AccessKind,
        privilege: PrivilegeLevel,
    ) -> Result<(), PageFault> {
        if len == 0 {
            return Ok(());
        }
        let last = address.checked_add(len as u32 - 1).ok_or(PageFault {
            address,
            error: PageFaultErrorCode::empty(),
        })?;
        let mut page = address.align_down(PAGE_SIZE as u32);
        loop {
            let checked = if page < address { address } else { page };
            self.directory.check_access(memory, checked, access, privilege)?;
            match page.checked_add(PAGE_SIZE as u32) {
                Some(next) if next <= last => page = next,
                _ => return Ok(()),
            }
        }
    }

    /// Builds an independent copy of this address space.
    ///
    /// Every user page is copied eagerly into a new frame with the same flags. If
    /// memory runs out part-way, the partial copy is destroyed before returning.
    pub fn duplicate<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpace, AllocError> {
        let mut copy = AddressSpace {
            directory: PageDirectory::new_sharing_kernel(&self.directory, memory, frames)?,
        };

        for mapping in self.directory.user_mappings(memory) {
            let result = frames.allocate_frame().and_then(|frame| {
                memory.copy_frame(mapping.frame, frame);
                copy.directory
                    .map(memory, frames, mapping.page, frame, mapping.flags)
                    .inspect_err(|_| frames.free_frame(frame))
            });
            if let Err(err) = result {
                log::warn!(
                    "out of memory duplicating {:?} at {}; discarding partial copy",
                    self.directory.root(),
                    mapping.page
                );
                copy.destroy(memory, frames);
                return Err(err);
            }
        }

        Ok(copy)
    }

    /// Returns the number of frames this address space owns: mapped user pages,
    /// user page tables and the directory itself.
    pub fn owned_frames<M: PhysicalMemory>(&self, memory: &mut M) -> usize {
        self.directory.user_mappings(memory).len() + self.directory.user_tables(memory).len() + 1
    }

    /// Returns every frame owned by this address space to `frames`.
    ///
    /// # Panics
    /// In debug builds, panics if the address space is still active.
    pub fn destroy<M: PhysicalMemory>(self, memory: &mut M, frames: &mut FrameAllocator) {
        for mapping in self.directory.user_mappings(memory) {
            frames.free_frame(mapping.frame);
        }
        log::trace!("destroyed address space {:?}", self.directory.root());
        self.directory.release(memory, frames);
    }
}
