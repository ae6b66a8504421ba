//! Bitmap-based physical frame allocator.
//!
//! One bit per frame below the highest usable frame; a set bit means the frame is
//! in use (or was never usable). Allocation scans for the first clear bit starting
//! from a hint that trails the lowest freed word, so a freed frame is found again
//! by the next allocation.

use alloc::{vec, vec::Vec};
use core::fmt;

use crate::{FrameNumber, MemoryMap, PhysicalFrame};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Errors that can occur during frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every usable frame is already allocated.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// Tracks which physical frames are free.
pub struct FrameAllocator {
    bitmap: Vec<u64>,
    frame_limit: FrameNumber,
    total: usize,
    free: usize,
    next_word: usize,
}

impl FrameAllocator {
    /// Builds an allocator in which exactly the usable frames of `map` are free.
    pub fn new(map: &MemoryMap) -> Self {
        let frame_limit = map.frame_limit();
        let words = frame_limit.as_usize().div_ceil(BITS_PER_WORD);
        let mut bitmap = vec![u64::MAX; words];

        for range in map.usable_ranges() {
            for number in range.start.as_usize()..range.end.as_usize() {
                bitmap[number / BITS_PER_WORD] &= !(1 << (number % BITS_PER_WORD));
            }
        }

        let total = map.usable_frame_count();
        log::debug!(
            "frame allocator: {} free frames below {:#010x}",
            total,
            frame_limit.start().as_u32()
        );

        Self {
            bitmap,
            frame_limit,
            total,
            free: total,
            next_word: 0,
        }
    }

    /// Returns one free frame and marks it used.
    pub fn allocate_frame(&mut self) -> Result<PhysicalFrame, AllocError> {
        if self.free == 0 {
            return Err(AllocError::OutOfMemory);
        }

        let words = self.bitmap.len();
        for offset in 0..words {
            let index = (self.next_word + offset) % words;
            let word = self.bitmap[index];
            if word == u64::MAX {
                continue;
            }

            let bit = word.trailing_ones() as usize;
            self.bitmap[index] |= 1 << bit;
            self.free -= 1;
            self.next_word = index;

            let frame = PhysicalFrame::from_number(FrameNumber::new(
                (index * BITS_PER_WORD + bit) as u32,
            ));
            log::trace!("allocated {:?}", frame);
            return Ok(frame);
        }

        // The free count said otherwise; treat the bitmap as authoritative.
        self.free = 0;
        Err(AllocError::OutOfMemory)
    }

    /// Returns a frame to the free pool.
    ///
    /// The caller must have removed every page-table reference to the frame first.
    ///
    /// # Panics
    ///
    /// Panics if the frame lies outside the memory this allocator manages.
    pub fn free_frame(&mut self, frame: PhysicalFrame) {
        let number = frame.number();
        assert!(
            number < self.frame_limit,
            "{frame:?} is not managed by this allocator"
        );

        let index = number.as_usize() / BITS_PER_WORD;
        let mask = 1u64 << (number.as_usize() % BITS_PER_WORD);
        let was_allocated = self.bitmap[index] & mask != 0;
        debug_assert!(was_allocated, "double free of {frame:?}");
        if !was_allocated {
            log::error!("ignoring double free of {:?}", frame);
            return;
        }

        self.bitmap[index] &= !mask;
        self.free += 1;
        if index < self.next_word {
            self.next_word = index;
        }
        log::trace!("freed {:?}", frame);
    }

    /// Returns true if the frame is currently allocated or was never usable.
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        let number = frame.number().as_usize();
        match self.bitmap.get(number / BITS_PER_WORD) {
            Some(word) => word & (1 << (number % BITS_PER_WORD)) != 0,
            None => true,
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Number of frames this allocator started with.
    pub fn total_frames(&self) -> usize {
        self.total
    }
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("free", &self.free)
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::PhysicalAddress;

    fn allocator_with(frames: u64) -> FrameAllocator {
        let mut map = MemoryMap::new();
        map.add_usable(0, frames * 4096);
        FrameAllocator::new(&map)
    }

    #[test]
    fn allocator_starts_with_usable_frames_free() {
        let allocator = allocator_with(100);
        assert_eq!(allocator.free_frames(), 100);
        assert_eq!(allocator.total_frames(), 100);
    }

    #[test]
    fn reserved_frames_are_never_handed_out() {
        let mut map = MemoryMap::new();
        map.add_usable(0, 16 * 4096);
        map.reserve(PhysicalAddress::new(0), 4 * 4096);
        let mut allocator = FrameAllocator::new(&map);

        let mut seen = Vec::new();
        while let Ok(frame) = allocator.allocate_frame() {
            seen.push(frame.number().as_u32());
        }

        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|&n| n >= 4));
    }

    #[test]
    fn allocations_are_exclusive() {
        let mut allocator = allocator_with(300);
        let mut outstanding = BTreeSet::new();

        for round in 0..5 {
            for _ in 0..50 {
                let frame = allocator.allocate_frame().expect("frame available");
                assert!(outstanding.insert(frame), "{frame:?} handed out twice");
                assert!(allocator.is_allocated(frame));
            }
            // Release every third outstanding frame.
            let released: Vec<_> = outstanding
                .iter()
                .copied()
                .enumerate()
                .filter(|(i, _)| (i + round) % 3 == 0)
                .map(|(_, f)| f)
                .collect();
            for frame in released {
                outstanding.remove(&frame);
                allocator.free_frame(frame);
                assert!(!allocator.is_allocated(frame));
            }
            assert_eq!(allocator.free_frames(), 300 - outstanding.len());
        }
    }

    #[test]
    fn out_of_memory_then_reuse_after_free() {
        let mut allocator = allocator_with(70);
        let mut frames = Vec::new();
        loop {
            match allocator.allocate_frame() {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    assert_eq!(err, AllocError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(frames.len(), 70);
        assert_eq!(allocator.allocate_frame(), Err(AllocError::OutOfMemory));

        let victim = frames[37];
        allocator.free_frame(victim);
        assert_eq!(allocator.allocate_frame(), Ok(victim));
        assert_eq!(allocator.allocate_frame(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn empty_map_is_out_of_memory() {
        let mut allocator = FrameAllocator::new(&MemoryMap::new());
        assert_eq!(allocator.allocate_frame(), Err(AllocError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "not managed by this allocator")]
    fn freeing_unmanaged_frame_panics() {
        let mut allocator = allocator_with(4);
        allocator.free_frame(PhysicalFrame::containing(PhysicalAddress::new(0x10_0000)));
    }
}
