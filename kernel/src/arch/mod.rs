//! Architecture interface.
//!
//! The rest of the kernel reaches the CPU only through this module: port
//! I/O, interrupt enable/disable, the TSC tick counter, 64-bit atomics and
//! `hlt`. On the build host (unit tests) the hardware entry points are
//! inert stubs so hardware-independent subsystems still compile.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

// ---------------------------------------------------------------------------
// Interrupt control
// ---------------------------------------------------------------------------

/// Enable maskable interrupts (`sti`).
#[inline]
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable();
}

/// Disable maskable interrupts (`cli`).
#[inline]
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::disable();
}

/// Whether maskable interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Halt forever with interrupts disabled. Terminal error path.
pub fn halt_forever() -> ! {
    disable_interrupts();
    loop {
        halt();
    }
}

// ---------------------------------------------------------------------------
// Timestamp counter
// ---------------------------------------------------------------------------

/// Read the CPU timestamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: rdtsc has no side effects beyond reading the counter.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        use core::sync::atomic::{AtomicU64, Ordering};
        static FAKE_TSC: AtomicU64 = AtomicU64::new(0);
        FAKE_TSC.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Port I/O
// ---------------------------------------------------------------------------

/// Read a byte from an I/O port.
///
/// # Safety
/// Port reads can have device side effects; the caller must know the port.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u8>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.read() }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = port;
        0
    }
}

/// Write a byte to an I/O port.
///
/// # Safety
/// Port writes reach hardware; the caller must know the port and value.
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u8>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.write(value) }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (port, value);
    }
}

/// Read a 16-bit word from an I/O port.
///
/// # Safety
/// Port reads can have device side effects; the caller must know the port.
#[inline]
pub unsafe fn inw(port: u16) -> u16 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u16>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.read() }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = port;
        0
    }
}

/// Write a 16-bit word to an I/O port.
///
/// # Safety
/// Port writes reach hardware; the caller must know the port and value.
#[inline]
pub unsafe fn outw(port: u16, value: u16) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u16>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.write(value) }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (port, value);
    }
}

/// Read a 32-bit long from an I/O port.
///
/// # Safety
/// Port reads can have device side effects; the caller must know the port.
#[inline]
pub unsafe fn inl(port: u16) -> u32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u32>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.read() }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = port;
        0
    }
}

/// Write a 32-bit long to an I/O port.
///
/// # Safety
/// Port writes reach hardware; the caller must know the port and value.
#[inline]
pub unsafe fn outl(port: u16, value: u32) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut p = ::x86_64::instructions::port::Port::<u32>::new(port);
        // SAFETY: forwarded to the caller's contract.
        unsafe { p.write(value) }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (port, value);
    }
}

// ---------------------------------------------------------------------------
// 64-bit atomics
// ---------------------------------------------------------------------------

/// Atomic operations on a 64-bit location, as required by the CPU
/// interface contract. Thin, inlined wrappers over `AtomicU64`.
pub mod atomic {
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Atomically store `value`, returning the previous value.
    #[inline]
    pub fn swap(location: &AtomicU64, value: u64) -> u64 {
        location.swap(value, Ordering::AcqRel)
    }

    /// Atomically store `value`.
    #[inline]
    pub fn store(location: &AtomicU64, value: u64) {
        location.store(value, Ordering::Release)
    }

    /// Atomically increment, returning the previous value.
    #[inline]
    pub fn inc(location: &AtomicU64) -> u64 {
        location.fetch_add(1, Ordering::AcqRel)
    }

    /// Atomically decrement, returning the previous value.
    #[inline]
    pub fn dec(location: &AtomicU64) -> u64 {
        location.fetch_sub(1, Ordering::AcqRel)
    }
}
