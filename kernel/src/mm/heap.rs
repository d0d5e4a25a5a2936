//! Kernel heap.
//!
//! A first-fit allocator fed whole frames: a contiguous run at boot, and
//! another run appended when an allocation misses. Only when the frame
//! allocator itself is exhausted does an allocation return null, which the
//! `alloc_error_handler` turns into a panic for kernel callers.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use core::alloc::{GlobalAlloc, Layout};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use crate::mm::{self, frame_allocator, FRAME_SIZE};

/// Initial heap size: 4 MiB (1024 frames).
pub const INITIAL_HEAP_FRAMES: u64 = 1024;

/// Frames added per extension when the heap runs out.
pub const EXTEND_FRAMES: u64 = 256;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static HEAP: LockedHeap = LockedHeap::empty();

/// The global allocator: first-fit over the heap region, growing by a
/// frame run on a miss.
pub struct KernelAllocator;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Ok(block) = HEAP.lock().allocate_first_fit(layout) {
            return block.as_ptr();
        }
        // Out of heap: pull more frames and retry once.
        if extend() {
            if let Ok(block) = HEAP.lock().allocate_first_fit(layout) {
                return block.as_ptr();
            }
        }
        core::ptr::null_mut()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = core::ptr::NonNull::new(ptr) {
            // SAFETY: `ptr` came from this allocator with this layout.
            unsafe { HEAP.lock().deallocate(ptr, layout) };
        }
    }
}

/// Carve the initial heap out of the frame allocator.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let run = frame_allocator::with_frame_allocator(|fa| fa.alloc_n(INITIAL_HEAP_FRAMES))
            .expect("not enough contiguous frames for the kernel heap");
        let base = mm::phys_to_virt(run.as_addr());
        let size = INITIAL_HEAP_FRAMES as usize * FRAME_SIZE;

        // SAFETY: the frame run was just allocated for exclusive heap use
        // and the direct map covers it.
        unsafe {
            HEAP.lock().init(base, size);
        }

        log::info!("heap: {} KiB at {:p}", size / 1024, base);
    }
}

/// Try to grow the heap by another run of frames.
///
/// The first-fit heap can only grow contiguously, so a run that does not
/// land at the current top is returned to the frame allocator and the
/// growth fails.
pub fn extend() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let Ok(run) = frame_allocator::with_frame_allocator(|fa| fa.alloc_n(EXTEND_FRAMES)) else {
            return false;
        };
        let base = mm::phys_to_virt(run.as_addr());
        let size = EXTEND_FRAMES as usize * FRAME_SIZE;

        let mut heap = HEAP.lock();
        if heap.top() != base {
            drop(heap);
            frame_allocator::with_frame_allocator(|fa| fa.free_n(run, EXTEND_FRAMES));
            return false;
        }

        // SAFETY: the run was just allocated and sits directly above the
        // current heap top.
        unsafe {
            heap.extend(size);
        }
        true
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

/// Heap statistics: (used bytes, free bytes).
pub fn stats() -> (usize, usize) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let heap = HEAP.lock();
        (heap.used(), heap.free())
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        (0, 0)
    }
}
