//! NebulaOS kernel entry.
//!
//! A multiboot2 loader enters `_start` with the magic in `eax`/`edi` and
//! the information block address in `ebx`/`esi` (the boot stub has
//! already switched to long mode and established the direct physical
//! mapping). Bring-up order: serial and logging, CPU tables, multiboot
//! parse, physical memory, heap, interrupts, input drivers, VFS, block
//! devices, syscalls, scheduler, then the fork into the user-space shell
//! and the idle loop.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
use nebula_kernel::{
    arch, boot, desktop, drivers, fs, graphics, logging, mm, process, sched, serial, shell,
    symbols, syscall, timer,
};

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                // multiboot2 magic
    .long 0                         // architecture (protected mode i386)
    .long multiboot_header_end - multiboot_header_start
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // End tag
    .word 0
    .word 0
    .long 8
multiboot_header_end:
"#
);

// Kernel image extent, provided by the linker script.
#[cfg(target_os = "none")]
extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(magic: u32, info_addr: u64) -> ! {
    kernel_main(magic, info_addr)
}

#[cfg(target_os = "none")]
fn kernel_main(magic: u32, info_addr: u64) -> ! {
    serial::init();
    logging::init();

    log::info!("NebulaOS booting");

    if magic != boot::multiboot::BOOTLOADER_MAGIC {
        panic!("bad multiboot2 magic: {:#x}", magic);
    }

    // CPU tables first so faults are reportable.
    arch::x86_64::init();

    // SAFETY: the loader's info block stays mapped for the kernel's
    // lifetime.
    let info = unsafe { boot::multiboot::parse(info_addr) };
    if let Some(cmdline) = info.cmdline {
        log::info!("command line: {:?}", cmdline);
    }

    // SAFETY: linker-provided symbols delimit the loaded image.
    let (kernel_start, kernel_end) = unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as u64,
            core::ptr::addr_of!(__kernel_end) as u64,
        )
    };
    mm::init(&info.memory_map, kernel_start, kernel_end);

    if let Some(sections) = &info.elf_sections {
        // SAFETY: loader-provided section headers, mapped for the
        // kernel's lifetime.
        unsafe { symbols::init_from_multiboot(sections) };
    }

    // Interrupt delivery: tick broker plus input drivers, then enable.
    timer::init();
    drivers::init();
    arch::enable_interrupts();

    fs::init().expect("VFS install failed");
    // The IDE driver registers its block-device class and instances
    // behind this surface during PCI bring-up; /dev/hdaN appears once it
    // probes. Root stays on ramfs until a disk filesystem mounts over it.

    syscall::init();
    sched::init();

    // Window system over whatever mode the display engine configured.
    if let Some((w, h)) = graphics::framebuffer::mode() {
        drivers::mouse::set_screen_bounds(w as u16, h as u16);
    }
    desktop::init();

    // First user process: the on-disk shell when present. Without one,
    // pid 0 gets console stdio and drops into the kernel shell instead.
    let have_init = match process::exec::spawn_init("/bin/sh", &[]) {
        Ok(pid) => {
            log::info!("init process ready as pid {}", pid);
            true
        }
        Err(e) => {
            log::warn!("no /bin/sh ({}); falling back to the kernel shell", e);
            wire_console_stdio();
            false
        }
    };
    sched::start();

    if !have_init {
        shell::run("nebula> ", shell::default_handler);
    }

    // Pid 0 becomes the idle flow: pump the desktop, halt until the next
    // interrupt.
    loop {
        desktop::pump();
        arch::halt();
    }
}

/// Give the idle process console stdio so the kernel shell can run on it.
#[cfg(target_os = "none")]
fn wire_console_stdio() {
    let Ok(console) = fs::kopen("/dev/console", fs::OpenFlags::RDWR) else {
        return;
    };
    process::with_table(|t| {
        let proc = t.current_proc_mut();
        for fd in 0..3 {
            let _ = proc.fds.set(
                fd,
                fs::FileDescriptor {
                    node: console.clone_ref(),
                    offset: 0,
                    mode: fs::OpenFlags::RDWR,
                },
            );
        }
    });
    console.close();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::disable_interrupts();
    nebula_kernel::println!("KERNEL PANIC: {}", info);

    // Symbolic backtrace from the panic site.
    let rip = panic_rip();
    symbols::print_backtrace(rip);

    arch::halt_forever();
}

#[cfg(target_os = "none")]
#[inline(always)]
fn panic_rip() -> u64 {
    let rip: u64;
    // SAFETY: reads the current instruction pointer.
    unsafe { core::arch::asm!("lea {}, [rip]", out(reg) rip) };
    rip
}

// Host builds only compile the library; the kernel binary is inert.
#[cfg(not(target_os = "none"))]
fn main() {}
