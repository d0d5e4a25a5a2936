//! Synchronization primitives.
//!
//! The kernel-wide locking vocabulary: a compare-and-swap spinlock and an
//! IRQ-saving variant for data shared with interrupt handlers.

pub mod spinlock;

pub use spinlock::{IrqSpinLock, SpinLock};
