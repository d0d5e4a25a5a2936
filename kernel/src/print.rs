// Print macros for kernel output

/// Print to the kernel console (serial on bare metal, stdout on the host).
#[cfg(target_os = "none")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::serial::_serial_print(format_args!($($arg)*)));
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host builds (unit tests) route through std so output interleaves with the
// test harness.
#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => (std::print!($($arg)*));
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => (std::println!());
    ($($arg:tt)*) => (std::println!($($arg)*));
}
