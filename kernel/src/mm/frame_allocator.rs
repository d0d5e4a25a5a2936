//! Physical frame allocator.
//!
//! One bit per 4 KiB frame (1 = used) over all of RAM. Initialization marks
//! every frame busy, then releases frames lying wholly inside loader-reported
//! available regions and outside the kernel image and the bitmap itself.
//! Frame 0 stays permanently used so a zero frame number can serve as a
//! sentinel. Contiguous runs use a linear first-fit scan that skips all-ones
//! words before testing bits individually.

use crate::{
    boot::MemoryMap,
    error::{KernelError, KernelResult},
    mm::{self, FrameNumber, PhysicalAddress, FRAME_SIZE},
    sync::IrqSpinLock,
};

/// Bitmap frame allocator state.
pub struct FrameAllocator {
    /// Bitmap storage, one bit per frame, 1 = used.
    bitmap: *mut u64,
    /// Number of 64-bit words in the bitmap.
    words: usize,
    /// Total frames tracked.
    max_frames: u64,
    /// Number of set bits (including the frame 0 sentinel).
    used: u64,
}

// SAFETY: the allocator is only reached through the IRQ-safe global lock.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Create an allocator over raw bitmap storage with every frame marked
    /// used.
    ///
    /// # Safety
    /// `bitmap` must point at writable storage of at least
    /// `max_frames.div_ceil(64)` words that outlives the allocator.
    pub unsafe fn from_raw(bitmap: *mut u64, max_frames: u64) -> Self {
        let words = max_frames.div_ceil(64) as usize;
        // SAFETY: storage size guaranteed by the caller.
        unsafe {
            for i in 0..words {
                bitmap.add(i).write(u64::MAX);
            }
        }
        Self {
            bitmap,
            words,
            max_frames,
            used: max_frames,
        }
    }

    #[inline]
    fn test_bit(&self, frame: u64) -> bool {
        // SAFETY: index checked against max_frames by all callers.
        unsafe { *self.bitmap.add((frame / 64) as usize) & (1 << (frame % 64)) != 0 }
    }

    #[inline]
    fn set_bit(&mut self, frame: u64) {
        if !self.test_bit(frame) {
            // SAFETY: as in test_bit.
            unsafe {
                *self.bitmap.add((frame / 64) as usize) |= 1 << (frame % 64);
            }
            self.used += 1;
        }
    }

    #[inline]
    fn clear_bit(&mut self, frame: u64) {
        if self.test_bit(frame) {
            // SAFETY: as in test_bit.
            unsafe {
                *self.bitmap.add((frame / 64) as usize) &= !(1 << (frame % 64));
            }
            self.used -= 1;
        }
    }

    /// Release the frames lying wholly inside `[start, start + len)`.
    pub fn mark_region_free(&mut self, start: u64, len: u64) {
        let first = mm::align_up(start, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        let last = mm::align_down(start + len, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        for frame in first..last.min(self.max_frames) {
            self.clear_bit(frame);
        }
    }

    /// Reserve every frame overlapping `[start, start + len)`.
    pub fn mark_region_used(&mut self, start: u64, len: u64) {
        let first = mm::align_down(start, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        let last = mm::align_up(start + len, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        for frame in first..last.min(self.max_frames) {
            self.set_bit(frame);
        }
    }

    /// Find the first free frame.
    fn first_free(&self) -> Option<u64> {
        for word_idx in 0..self.words {
            // SAFETY: word_idx < self.words.
            let word = unsafe { *self.bitmap.add(word_idx) };
            if word == u64::MAX {
                continue;
            }
            for bit in 0..64 {
                let frame = word_idx as u64 * 64 + bit;
                if frame >= self.max_frames {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    return Some(frame);
                }
            }
        }
        None
    }

    /// Find the first run of `count` contiguous free frames (first fit).
    fn first_free_run(&self, count: u64) -> Option<u64> {
        let mut consecutive = 0u64;
        let mut word_idx = 0usize;
        while word_idx < self.words {
            // SAFETY: word_idx < self.words.
            let word = unsafe { *self.bitmap.add(word_idx) };
            if word == u64::MAX {
                consecutive = 0;
                word_idx += 1;
                continue;
            }
            for bit in 0..64 {
                let frame = word_idx as u64 * 64 + bit;
                if frame >= self.max_frames {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    consecutive += 1;
                    if consecutive == count {
                        return Some(frame + 1 - count);
                    }
                } else {
                    consecutive = 0;
                }
            }
            word_idx += 1;
        }
        None
    }

    /// Allocate one frame.
    pub fn alloc(&mut self) -> KernelResult<FrameNumber> {
        let frame = self.first_free().ok_or(KernelError::OutOfMemory)?;
        self.set_bit(frame);
        Ok(FrameNumber::new(frame))
    }

    /// Allocate a run of `count` contiguous frames.
    pub fn alloc_n(&mut self, count: u64) -> KernelResult<FrameNumber> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let start = self
            .first_free_run(count)
            .ok_or(KernelError::OutOfMemory)?;
        for frame in start..start + count {
            self.set_bit(frame);
        }
        Ok(FrameNumber::new(start))
    }

    /// Allocate one frame and zero it.
    pub fn alloc_zeroed(&mut self) -> KernelResult<FrameNumber> {
        let frame = self.alloc()?;
        zero_frames(frame, 1);
        Ok(frame)
    }

    /// Allocate a zeroed run of `count` contiguous frames.
    pub fn alloc_n_zeroed(&mut self, count: u64) -> KernelResult<FrameNumber> {
        let start = self.alloc_n(count)?;
        zero_frames(start, count);
        Ok(start)
    }

    /// Release one frame. The contents are not cleared.
    pub fn free(&mut self, frame: FrameNumber) {
        if frame.as_u64() != 0 && frame.as_u64() < self.max_frames {
            self.clear_bit(frame.as_u64());
        }
    }

    /// Release a run of frames. The contents are not cleared.
    pub fn free_n(&mut self, frame: FrameNumber, count: u64) {
        for f in frame.as_u64()..(frame.as_u64() + count).min(self.max_frames) {
            if f != 0 {
                self.clear_bit(f);
            }
        }
    }

    /// Frames in use, excluding the frame 0 sentinel.
    pub fn used_blocks(&self) -> u64 {
        self.used - 1
    }

    /// Frames currently free.
    pub fn free_blocks(&self) -> u64 {
        self.max_frames - self.used
    }

    /// Total frames tracked.
    pub fn total_blocks(&self) -> u64 {
        self.max_frames
    }

    /// Number of set bits, recounted from storage (diagnostic; property
    /// checks compare this against the running counter).
    pub fn count_set_bits(&self) -> u64 {
        let mut total = 0u64;
        for word_idx in 0..self.words {
            // SAFETY: word_idx < self.words.
            let mut word = unsafe { *self.bitmap.add(word_idx) };
            // Bits past max_frames in the last word are padding.
            let base = word_idx as u64 * 64;
            if base + 64 > self.max_frames {
                let valid = self.max_frames - base;
                word &= (1u64 << valid) - 1;
            }
            total += word.count_ones() as u64;
        }
        total
    }
}

/// Zero a run of frames through the direct physical mapping.
fn zero_frames(start: FrameNumber, count: u64) {
    #[cfg(target_os = "none")]
    {
        let ptr = mm::phys_to_virt(start.as_addr());
        // SAFETY: the frames were just allocated and the direct map covers
        // all of RAM.
        unsafe {
            core::ptr::write_bytes(ptr, 0, count as usize * FRAME_SIZE);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (start, count);
    }
}

/// Global frame allocator, IRQ-safe: page faults and drivers allocate from
/// interrupt context.
pub static FRAME_ALLOCATOR: IrqSpinLock<Option<FrameAllocator>> = IrqSpinLock::new(None);

/// Run `f` with the global frame allocator locked.
///
/// Panics if physical memory management has not been initialized; every
/// caller runs after `mm::init`.
pub fn with_frame_allocator<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    let mut guard = FRAME_ALLOCATOR.lock();
    let fa = guard.as_mut().expect("frame allocator not initialized");
    f(fa)
}

/// Allocate one zeroed frame from the global allocator.
pub fn alloc_frame_zeroed() -> KernelResult<FrameNumber> {
    with_frame_allocator(|fa| fa.alloc_zeroed())
}

/// Release one frame to the global allocator.
pub fn free_frame(frame: FrameNumber) {
    with_frame_allocator(|fa| fa.free(frame));
}

/// Initialize the global allocator over the bitmap at `bitmap_addr`.
///
/// Marks everything used, frees loader-reported available regions, then
/// re-reserves the kernel image and the bitmap storage itself.
///
/// # Safety
/// `bitmap_addr` must be the physical address of a RAM region large enough
/// for `max_frames` bits and not otherwise in use.
pub unsafe fn init(
    bitmap_addr: u64,
    max_frames: u64,
    memory_map: &MemoryMap,
    kernel_extent: (u64, u64),
    bitmap_extent: (u64, u64),
) {
    let bitmap_virt = mm::phys_to_virt(PhysicalAddress::new(bitmap_addr)) as *mut u64;
    // SAFETY: forwarded from the caller's contract.
    let mut fa = unsafe { FrameAllocator::from_raw(bitmap_virt, max_frames) };

    for region in memory_map.available() {
        fa.mark_region_free(region.start, region.len);
    }

    fa.mark_region_used(kernel_extent.0, kernel_extent.1 - kernel_extent.0);
    fa.mark_region_used(bitmap_extent.0, bitmap_extent.1 - bitmap_extent.0);

    // Frame 0 is the permanent sentinel.
    fa.set_bit(0);

    *FRAME_ALLOCATOR.lock() = Some(fa);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::{boxed::Box, vec};

    use super::*;

    fn fresh_allocator(max_frames: u64) -> FrameAllocator {
        let words = max_frames.div_ceil(64) as usize;
        let storage = Box::leak(vec![0u64; words].into_boxed_slice());
        let mut fa = unsafe { FrameAllocator::from_raw(storage.as_mut_ptr(), max_frames) };
        // All RAM available, then the sentinel.
        fa.mark_region_free(0, max_frames * FRAME_SIZE as u64);
        fa.set_bit(0);
        fa
    }

    #[test]
    fn used_counter_matches_bitmap_popcount() {
        let mut fa = fresh_allocator(1024);

        let a = fa.alloc().expect("allocation from a fresh bitmap should succeed");
        let b = fa.alloc_n(10).expect("10-frame run should fit in 1023 free frames");
        assert_eq!(fa.used_blocks(), fa.count_set_bits() - 1);

        fa.free(a);
        fa.free_n(b, 10);
        assert_eq!(fa.used_blocks(), fa.count_set_bits() - 1);
        assert_eq!(fa.used_blocks(), 0);
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut fa = fresh_allocator(256);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..100 {
            let f = fa.alloc().expect("256-frame bitmap should serve 100 singles");
            assert!(seen.insert(f.as_u64()), "frame {} handed out twice", f.as_u64());
        }
        let run = fa.alloc_n(32).expect("32-frame run should still fit");
        for f in run.as_u64()..run.as_u64() + 32 {
            assert!(seen.insert(f), "run frame {} overlaps a single", f);
        }
    }

    #[test]
    fn frame_zero_is_never_returned() {
        let mut fa = fresh_allocator(128);
        for _ in 0..127 {
            if let Ok(f) = fa.alloc() {
                assert_ne!(f.as_u64(), 0);
            }
        }
        assert_eq!(fa.alloc().unwrap_err(), KernelError::OutOfMemory);
    }

    #[test]
    fn first_fit_returns_lowest_run() {
        let mut fa = fresh_allocator(256);
        let a = fa.alloc_n(4).expect("first run");
        assert_eq!(a.as_u64(), 1);
        let b = fa.alloc_n(4).expect("second run");
        assert_eq!(b.as_u64(), 5);

        // Free the first run; first fit must reuse it.
        fa.free_n(a, 4);
        let c = fa.alloc_n(3).expect("reuse of freed run");
        assert_eq!(c.as_u64(), 1);
    }

    #[test]
    fn region_marking_respects_partial_frames() {
        let words = 4;
        let storage = Box::leak(vec![0u64; words].into_boxed_slice());
        let mut fa = unsafe { FrameAllocator::from_raw(storage.as_mut_ptr(), 256) };

        // A region starting mid-frame must not free the straddled frame.
        fa.mark_region_free(FRAME_SIZE as u64 / 2, 3 * FRAME_SIZE as u64);
        assert!(fa.test_bit(0));
        assert!(!fa.test_bit(1));
        assert!(!fa.test_bit(2));
        assert!(fa.test_bit(3));
    }

    #[test]
    fn double_free_does_not_corrupt_counter() {
        let mut fa = fresh_allocator(64);
        let f = fa.alloc().expect("alloc");
        fa.free(f);
        fa.free(f);
        assert_eq!(fa.used_blocks(), fa.count_set_bits() - 1);
    }

    #[test]
    fn out_of_memory_reported_for_oversized_run() {
        let mut fa = fresh_allocator(64);
        assert_eq!(fa.alloc_n(100).unwrap_err(), KernelError::OutOfMemory);
        assert_eq!(fa.alloc_n(0).unwrap_err(), KernelError::InvalidArgument);
    }
}
