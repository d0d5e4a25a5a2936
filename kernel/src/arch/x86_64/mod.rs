//! x86_64 architecture support.
//!
//! Hardware bring-up (GDT, IDT, PIC remap) plus the context-switch and
//! ring-3 entry primitives the process model builds on.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod syscall;
pub mod usermode;

/// Initialize the CPU tables and interrupt controller.
///
/// Order matters: segments first, then the IDT, then the PIC remap so that
/// spurious vectors land in the remapped range. Interrupts remain disabled
/// until the caller explicitly enables them.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    log::info!("x86_64 CPU initialized (GDT/IDT/PIC)");
}
