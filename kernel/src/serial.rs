//! COM1 debug serial port.
//!
//! All kernel diagnostics (boot progress, log records, panic reports) end up
//! here. The port is initialized once and shared behind a spinlock; printing
//! from interrupt context is safe because the lock is taken with interrupts
//! masked.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use lazy_static::lazy_static;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use uart_16550::SerialPort;

/// I/O port base of COM1.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    });
}

#[doc(hidden)]
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn _serial_print(_args: fmt::Arguments) {}

/// Initialize the serial port early in boot so panics are visible.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        lazy_static::initialize(&SERIAL1);
    }
}
