//! Memory management.
//!
//! Three layers, bottom up: the bitmap physical frame allocator
//! ([`frame_allocator`]), the 4-level paging editor ([`page_table`],
//! [`address_space`]) and the kernel heap ([`heap`]). `init` wires them
//! together from the loader-provided memory map.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;

pub use address_space::AddressSpace;
pub use frame_allocator::{with_frame_allocator, FrameAllocator, FRAME_ALLOCATOR};
pub use page_table::{PageFlags, PageTable, PageTableEntry, PageTableIndex};

use crate::boot::MemoryMap;

/// Size of a physical frame / virtual page (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// Base of the direct physical-memory mapping established by the boot stub.
/// This is the first entry of the kernel half of every address space.
pub const PHYS_MAP_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Number of top-level entries forming the per-process (user) half.
/// Entries at and above this index are the shared kernel half.
pub const KERNEL_HALF_START: usize = 256;

/// Physical frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }
}

/// Virtual address of a physical address through the direct mapping.
#[inline]
pub fn phys_to_virt(phys: PhysicalAddress) -> *mut u8 {
    #[cfg(target_os = "none")]
    {
        (PHYS_MAP_OFFSET + phys.as_u64()) as *mut u8
    }
    #[cfg(not(target_os = "none"))]
    {
        // Host builds never dereference physical memory; identity keeps the
        // arithmetic testable.
        phys.as_u64() as *mut u8
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Root page-table frame of the boot (kernel) address space.
static KERNEL_ROOT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// The boot address space's root table frame, captured at `mm::init`.
/// Every process's kernel half aliases these tables.
pub fn kernel_root() -> FrameNumber {
    FrameNumber::new(KERNEL_ROOT.load(core::sync::atomic::Ordering::Relaxed))
}

/// Initialize physical memory management and the kernel heap.
///
/// The frame bitmap is placed in the first frames after the kernel image;
/// the bitmap's own frames and the kernel extent are marked used, matching
/// the invariant that the used set covers kernel, bitmap and non-RAM.
pub fn init(memory_map: &MemoryMap, kernel_start: u64, kernel_end: u64) {
    let top = memory_map.top_of_ram();
    let max_frames = align_up(top, FRAME_SIZE as u64) / FRAME_SIZE as u64;

    let bitmap_addr = align_up(kernel_end, FRAME_SIZE as u64);
    let bitmap_bytes = align_up(max_frames.div_ceil(8), FRAME_SIZE as u64);

    // SAFETY: the region right after the kernel image is RAM reserved for
    // the bitmap and is excluded from allocation below.
    unsafe {
        frame_allocator::init(
            bitmap_addr,
            max_frames,
            memory_map,
            (kernel_start, kernel_end),
            (bitmap_addr, bitmap_addr + bitmap_bytes),
        );
    }

    heap::init();

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    KERNEL_ROOT.store(
        AddressSpace::current().root().as_u64(),
        core::sync::atomic::Ordering::Relaxed,
    );

    with_frame_allocator(|fa| {
        log::info!(
            "{} frames total, {} used after init",
            max_frames,
            fa.used_blocks()
        );
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn frame_addr_round_trip() {
        let frame = FrameNumber::new(42);
        assert_eq!(frame.as_addr().as_u64(), 42 * 4096);
        assert_eq!(frame.as_addr().as_frame(), frame);
    }
}
