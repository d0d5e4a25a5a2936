//! Chained 8259 programmable interrupt controllers.
//!
//! The PICs are remapped so hardware IRQs 0-15 arrive at vectors 32-47,
//! clear of the CPU exception range.

use pic8259::ChainedPics;
use spin::Mutex;

use super::idt::IRQ_BASE;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(IRQ_BASE, IRQ_BASE + 8) });

/// Remap and unmask the PICs.
pub fn init() {
    // SAFETY: the offsets steer clear of CPU exception vectors.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Signal end-of-interrupt for the given vector.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: only called from interrupt dispatch with a vector in the
    // remapped IRQ range.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
