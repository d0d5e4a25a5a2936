//! Interrupt core: the IRQ handler registry and dispatch path.
//!
//! Vector classification happens in the IDT stubs: CPU exceptions (0-31)
//! are reported and halt when unhandled, hardware IRQs (32-47) land in
//! [`handle_irq`], vector 0x80 enters the syscall path, and everything else
//! is spurious. Here we keep the per-IRQ handler table: a plain array
//! indexed by IRQ number where re-registration replaces the previous
//! handler. Handlers run with interrupts disabled and to completion; the
//! end-of-interrupt is signalled to the controller before the handler's
//! effects can reschedule anything.

use crate::sync::IrqSpinLock;

/// Number of hardware IRQ lines behind the chained PICs.
pub const IRQ_COUNT: usize = 16;

/// An IRQ handler: receives the IRQ number that fired.
pub type IrqHandler = fn(u8);

/// Registered handlers, indexed by IRQ number.
static HANDLERS: IrqSpinLock<[Option<IrqHandler>; IRQ_COUNT]> =
    IrqSpinLock::new([None; IRQ_COUNT]);

/// Count of dispatched hardware interrupts (diagnostic).
static DISPATCH_COUNT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Register (or replace) the handler for `irq`.
pub fn register_handler(irq: u8, handler: IrqHandler) {
    if (irq as usize) < IRQ_COUNT {
        HANDLERS.lock()[irq as usize] = Some(handler);
    }
}

/// Remove the handler for `irq`.
pub fn unregister_handler(irq: u8) {
    if (irq as usize) < IRQ_COUNT {
        HANDLERS.lock()[irq as usize] = None;
    }
}

/// Dispatch a hardware interrupt. Called from the IDT stubs with
/// interrupts disabled.
///
/// The handler is copied out of the table before the call so the table
/// lock is never held across driver code, and EOI is signalled before the
/// handler runs so a handler that switches context (the timer tick driving
/// the scheduler) leaves the controller ready for the next interrupt.
pub fn handle_irq(irq: u8) {
    DISPATCH_COUNT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    let handler = if (irq as usize) < IRQ_COUNT {
        HANDLERS.lock()[irq as usize]
    } else {
        None
    };

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::idt::end_of_interrupt(irq);

    if let Some(handler) = handler {
        handler(irq);
    }
    // No handler: spurious, already acknowledged.
}

/// Number of hardware interrupts dispatched since boot.
pub fn dispatch_count() -> u64 {
    DISPATCH_COUNT.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    // Each test uses its own IRQ line and counter so they can run in
    // parallel.
    static FIRED_A: AtomicU32 = AtomicU32::new(0);
    static FIRED_B: AtomicU32 = AtomicU32::new(0);

    fn handler_a(_irq: u8) {
        FIRED_A.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_b(irq: u8) {
        FIRED_B.fetch_add(100 + irq as u32, Ordering::Relaxed);
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        register_handler(5, handler_a);
        handle_irq(5);
        assert_eq!(FIRED_A.load(Ordering::Relaxed), 1);
        unregister_handler(5);
    }

    #[test]
    fn reregistration_replaces_handler() {
        register_handler(6, handler_a);
        register_handler(6, handler_b);
        handle_irq(6);
        assert_eq!(FIRED_B.load(Ordering::Relaxed), 106);
        unregister_handler(6);
    }

    #[test]
    fn unhandled_irq_is_spurious() {
        let before = dispatch_count();
        handle_irq(11);
        handle_irq(200); // out of range, also ignored
        assert!(dispatch_count() >= before + 2);
    }
}
