//! Access to the contents of physical frames.
//!
//! The kernel never dereferences a [`PhysicalAddress`]. Every read or write of a
//! frame that is not otherwise mapped goes through a [`PhysicalMemory`]
//! implementation, which decides how the frame is made reachable.

use core::cmp::min;

use crate::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, arch::PageTable};

/// The contents of one physical frame.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    /// Returns a zero-filled page.
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }

    /// Views the page as a page directory or page table.
    pub fn as_table(&self) -> &PageTable {
        // SAFETY: PageTable has the same size and alignment as Page, and every bit
        // pattern is a valid array of entries.
        unsafe { &*(self as *const Page as *const PageTable) }
    }

    /// Views the page as a mutable page directory or page table.
    pub fn as_table_mut(&mut self) -> &mut PageTable {
        // SAFETY: As in `as_table`.
        unsafe { &mut *(self as *mut Page as *mut PageTable) }
    }
}

const _: () = assert!(core::mem::size_of::<Page>() == core::mem::size_of::<PageTable>());
const _: () = assert!(core::mem::align_of::<Page>() == core::mem::align_of::<PageTable>());

/// Bytes copied per step by [`PhysicalMemory::copy_frame`].
const COPY_CHUNK: usize = 512;

/// A way to reach the bytes of physical frames.
pub trait PhysicalMemory {
    /// Runs `f` with the page stored in `frame`.
    fn with_page<R>(&mut self, frame: PhysicalFrame, f: impl FnOnce(&mut Page) -> R) -> R;

    /// Fills a frame with zeroes.
    fn zero_frame(&mut self, frame: PhysicalFrame) {
        self.with_page(frame, |page| page.0.fill(0));
    }

    /// Reads `buf.len()` bytes starting at `address`, crossing frames as needed.
    fn read(&mut self, address: PhysicalAddress, buf: &mut [u8]) {
        let mut address = address;
        let mut done = 0;
        while done < buf.len() {
            let offset = address.page_offset() as usize;
            let count = min(PAGE_SIZE - offset, buf.len() - done);
            let chunk = &mut buf[done..done + count];
            self.with_page(PhysicalFrame::containing(address), |page| {
                chunk.copy_from_slice(&page.0[offset..offset + count]);
            });
            done += count;
            address = address + count as u32;
        }
    }

    /// Writes `bytes` starting at `address`, crossing frames as needed.
    fn write(&mut self, address: PhysicalAddress, bytes: &[u8]) {
        let mut address = address;
        let mut done = 0;
        while done < bytes.len() {
            let offset = address.page_offset() as usize;
            let count = min(PAGE_SIZE - offset, bytes.len() - done);
            let chunk = &bytes[done..done + count];
            self.with_page(PhysicalFrame::containing(address), |page| {
                page.0[offset..offset + count].copy_from_slice(chunk);
            });
            done += count;
            address = address + count as u32;
        }
    }

    /// Reads a little-endian `u32`.
    fn read_u32(&mut self, address: PhysicalAddress) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Copies the whole of `source` into `destination`.
    fn copy_frame(&mut self, source: PhysicalFrame, destination: PhysicalFrame) {
        let mut chunk = [0u8; COPY_CHUNK];
        for offset in (0..PAGE_SIZE).step_by(COPY_CHUNK) {
            self.with_page(source, |page| {
                chunk.copy_from_slice(&page.0[offset..offset + COPY_CHUNK]);
            });
            self.with_page(destination, |page| {
                page.0[offset..offset + COPY_CHUNK].copy_from_slice(&chunk);
            });
        }
    }
}
