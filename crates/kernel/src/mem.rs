//! The kernel's view of memory: physical memory, the frame allocator and the
//! kernel page directory, bundled so they can be handed around together.

use pmm::{
    AccessKind, AllocError, FrameAllocator, PAGE_SIZE, PageDirectory, PageFault, PageFlags,
    PhysicalFrame, PhysicalMemory, VirtualAddress,
};
use x86_64::PrivilegeLevel;

/// Size of the kernel heap.
#[cfg(ringlet_hardware)]
pub const HEAP_SIZE: usize = 1024 * 1024;

#[cfg(ringlet_hardware)]
#[global_allocator]
static HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(ringlet_hardware)]
static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Hands the statically reserved heap area to the allocator.
///
/// # Safety
/// Must be called once, before the first allocation.
#[cfg(ringlet_hardware)]
pub unsafe fn init_heap() {
    // SAFETY: The area is only ever used by the allocator.
    unsafe {
        HEAP.lock().init((&raw mut HEAP_SPACE).cast::<u8>(), HEAP_SIZE);
    }
}

/// Physical memory, the frames in it and the kernel half of every address space.
pub struct KernelMemory<M: PhysicalMemory> {
    pub physical: M,
    pub frames: FrameAllocator,
    pub directory: PageDirectory,
}

impl<M: PhysicalMemory> KernelMemory<M> {
    pub fn new(physical: M, frames: FrameAllocator, directory: PageDirectory) -> Self {
        Self {
            physical,
            frames,
            directory,
        }
    }

    /// Makes sure the page tables covering `[start, start + len)` exist.
    ///
    /// Kernel tables must exist before any address space is created, because a
    /// new address space copies the kernel directory entries once.
    pub fn reserve_tables(&mut self, start: VirtualAddress, len: u32) -> Result<(), AllocError> {
        let end = start.as_u32() as u64 + len as u64;
        let mut table = start.align_down(pmm::TABLE_SPAN).as_u32() as u64;
        while table < end {
            self.directory.ensure_table(
                &mut self.physical,
                &mut self.frames,
                VirtualAddress::new(table as u32),
            )?;
            table += pmm::TABLE_SPAN as u64;
        }
        Ok(())
    }

    /// Backs the kernel page at `page` with a fresh zeroed frame.
    pub fn map_kernel_page(&mut self, page: VirtualAddress) -> Result<PhysicalFrame, AllocError> {
        debug_assert!(page.is_kernel(), "{page} is not a kernel address");
        let frame = self.frames.allocate_frame()?;
        self.physical.zero_frame(frame);
        match self.directory.map(
            &mut self.physical,
            &mut self.frames,
            page,
            frame,
            PageFlags::kernel_data(),
        ) {
            Ok(previous) => {
                if let Some(previous) = previous {
                    self.frames.free_frame(previous);
                }
                Ok(frame)
            }
            Err(err) => {
                self.frames.free_frame(frame);
                Err(err)
            }
        }
    }

    /// Unmaps a kernel page and frees the frame behind it.
    pub fn unmap_kernel_page(&mut self, page: VirtualAddress) {
        if let Some(frame) = self.directory.unmap(&mut self.physical, page) {
            self.frames.free_frame(frame);
        }
    }

    /// Reads kernel virtual memory.
    pub fn read(&mut self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < buf.len() {
            let virt = address + done as u32;
            let count = (PAGE_SIZE - virt.page_offset() as usize).min(buf.len() - done);
            let physical = self.directory.check_access(
                &mut self.physical,
                virt,
                AccessKind::Read,
                PrivilegeLevel::Ring0,
            )?;
            self.physical.read(physical, &mut buf[done..done + count]);
            done += count;
        }
        Ok(())
    }

    /// Writes kernel virtual memory.
    pub fn write(&mut self, address: VirtualAddress, bytes: &[u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < bytes.len() {
            let virt = address + done as u32;
            let count = (PAGE_SIZE - virt.page_offset() as usize).min(bytes.len() - done);
            let physical = self.directory.check_access(
                &mut self.physical,
                virt,
                AccessKind::Write,
                PrivilegeLevel::Ring0,
            )?;
            self.physical.write(physical, &bytes[done..done + count]);
            done += count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm::EmulatedMemory;

    fn memory(frames: usize) -> KernelMemory<EmulatedMemory> {
        let mut physical = EmulatedMemory::new(frames);
        let mut allocator = FrameAllocator::new(&physical.memory_map());
        let directory = PageDirectory::new(&mut physical, &mut allocator).expect("directory");
        KernelMemory::new(physical, allocator, directory)
    }

    #[test]
    fn kernel_pages_read_back_across_boundaries() {
        let mut memory = memory(32);
        let base = VirtualAddress::new(0xE000_0000);
        memory.map_kernel_page(base).expect("first");
        memory.map_kernel_page(base + 0x1000).expect("second");

        let data: Vec<u8> = (0..40u8).collect();
        memory.write(base + 0xFEC, &data).expect("write");
        let mut back = [0u8; 40];
        memory.read(base + 0xFEC, &mut back).expect("read");
        assert_eq!(&back[..], &data[..]);

        let fault = memory.read(base + 0x2000, &mut back).expect_err("unmapped");
        assert_eq!(fault.address, base + 0x2000);
    }

    #[test]
    fn unmapping_returns_the_frame() {
        let mut memory = memory(32);
        let page = VirtualAddress::new(0xE000_0000);
        memory.reserve_tables(page, 0x1000).expect("table");
        let free = memory.frames.free_frames();

        memory.map_kernel_page(page).expect("map");
        assert_eq!(memory.frames.free_frames(), free - 1);
        memory.unmap_kernel_page(page);
        assert_eq!(memory.frames.free_frames(), free);
        assert_eq!(memory.directory.translate(&mut memory.physical, page), None);
    }

    #[test]
    fn reserving_tables_covers_every_span() {
        let mut memory = memory(32);
        let free = memory.frames.free_frames();
        memory
            .reserve_tables(VirtualAddress::new(0xE03F_F000), 0x2000)
            .expect("tables");
        assert_eq!(free - memory.frames.free_frames(), 2);

        memory
            .reserve_tables(VirtualAddress::new(0xE000_0000), 0x80_0000)
            .expect("already there");
        assert_eq!(free - memory.frames.free_frames(), 2);
    }
}
