//! NebulaOS Kernel Library
//!
//! Core functionality for the NebulaOS kernel, exported as a library so the
//! hardware-independent subsystems (MPI, VFS, clip-region algebra, path
//! handling, schedulable queues) can also be unit-tested on the build host.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare metal the kernel heap (mm::heap) backs the global allocator:
// first fit over frame-fed storage, growing when it runs dry. On the
// build host, delegate to the system allocator so test code using
// Vec/String/Box compiles and runs under the standard #[test] harness.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod crypto;
pub mod desktop;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod shell;
pub mod symbols;
pub mod sync;
pub mod syscall;
pub mod timer;

// Re-exports used pervasively by the rest of the kernel
pub use error::{KernelError, KernelResult};
pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Heap allocation error handler.
///
/// Allocation failure in a no_std kernel is unrecoverable; the
/// alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
