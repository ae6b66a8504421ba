use core::fmt;

use crate::{FrameNumber, PhysicalAddress, arch};

/// A single 4 KiB frame of physical memory.
///
/// A frame is the allocator's unit of ownership. At any time it belongs to exactly
/// one of: a page-table structure, a process image or stack, a kernel structure, or
/// the free pool held by [`FrameAllocator`](crate::FrameAllocator).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalFrame {
    number: FrameNumber,
}

impl PhysicalFrame {
    /// Returns the frame that contains the given physical address.
    pub const fn containing(address: PhysicalAddress) -> Self {
        Self {
            number: address.frame_number(),
        }
    }

    /// Returns the frame starting at `address`, or `None` if the address is not
    /// page-aligned.
    pub const fn from_start_address(address: PhysicalAddress) -> Option<Self> {
        if address.page_offset() != 0 {
            return None;
        }
        Some(Self::containing(address))
    }

    /// Returns the frame with the given number.
    pub const fn from_number(number: FrameNumber) -> Self {
        Self { number }
    }

    /// Returns the physical address of the first byte of this frame.
    pub const fn start_address(self) -> PhysicalAddress {
        self.number.start()
    }

    /// Returns the frame number.
    pub const fn number(self) -> FrameNumber {
        self.number
    }

    /// Returns the size of a frame in bytes.
    pub const fn size(self) -> usize {
        arch::PAGE_SIZE
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame({:#010x})", self.start_address().as_u32())
    }
}
