//! Device drivers.
//!
//! The PS/2 input pipeline: keyboard and mouse decoders whose IRQ handlers
//! only enqueue events; the desktop pump consumes them outside interrupt
//! context.

pub mod keyboard;
pub mod mouse;

/// Hook the input IRQ handlers and bring both decoders up.
pub fn init() {
    keyboard::init();
    mouse::init();
}
