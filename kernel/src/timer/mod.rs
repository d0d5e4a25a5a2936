//! Timer tick broker.
//!
//! IRQ 0 increments a monotonic tick count and fans out to a single
//! registered on-tick callback, which drives the scheduler. The PIT is
//! programmed for [`TICK_HZ`] ticks per second.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{irq, sync::IrqSpinLock};

/// Timer interrupt frequency.
pub const TICK_HZ: u64 = 100;

/// Monotonic tick count since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// The single on-tick callback (the scheduler's entry point).
static ON_TICK: IrqSpinLock<Option<fn(u64)>> = IrqSpinLock::new(None);

/// Program the PIT and hook IRQ 0.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // PIT channel 0, rate generator, divisor for TICK_HZ.
        let divisor = (1_193_182u64 / TICK_HZ) as u16;
        // SAFETY: standard PIT programming sequence on ports 0x43/0x40.
        unsafe {
            crate::arch::outb(0x43, 0x36);
            crate::arch::outb(0x40, (divisor & 0xFF) as u8);
            crate::arch::outb(0x40, (divisor >> 8) as u8);
        }
    }

    irq::register_handler(0, timer_irq);
    log::info!("timer: {} Hz tick installed", TICK_HZ);
}

/// Install the on-tick callback. Re-installation replaces.
pub fn set_tick_handler(handler: fn(u64)) {
    *ON_TICK.lock() = Some(handler);
}

/// IRQ 0 handler: count the tick, then fan out.
fn timer_irq(_irq: u8) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let handler = *ON_TICK.lock();
    if let Some(handler) = handler {
        handler(now);
    }
}

/// Monotonic ticks since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Convert milliseconds to ticks, rounding up.
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(1000 / TICK_HZ)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn tick_count_is_monotonic() {
        let before = get_ticks();
        timer_irq(0);
        timer_irq(0);
        assert!(get_ticks() >= before + 2);
    }

    #[test]
    fn ms_conversion_rounds_up() {
        // At 100 Hz one tick is 10 ms.
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(0), 0);
    }
}
