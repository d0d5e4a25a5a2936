//! Boot protocol support.
//!
//! The kernel is entered by a multiboot2-compliant loader with a pointer to
//! its information block; [`multiboot`] turns that block into a typed
//! [`multiboot::BootInfo`] the rest of the bring-up consumes.

pub mod multiboot;

pub use multiboot::{BootInfo, MemoryMap, MemoryRegion, RegionKind};
