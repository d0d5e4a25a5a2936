// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    PrivilegeLevel, VirtAddr,
};

use super::pic;

/// Vector of the first hardware IRQ after the PIC remap.
pub const IRQ_BASE: u8 = 32;

/// Software interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

macro_rules! irq_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            crate::irq::handle_irq($irq);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions (vectors 0-31)
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST index refers to the dedicated double-fault stack
        // installed by gdt::init.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // Hardware IRQs (vectors 32-47)
        idt[IRQ_BASE].set_handler_fn(irq0_handler);
        idt[IRQ_BASE + 1].set_handler_fn(irq1_handler);
        idt[IRQ_BASE + 2].set_handler_fn(irq2_handler);
        idt[IRQ_BASE + 3].set_handler_fn(irq3_handler);
        idt[IRQ_BASE + 4].set_handler_fn(irq4_handler);
        idt[IRQ_BASE + 5].set_handler_fn(irq5_handler);
        idt[IRQ_BASE + 6].set_handler_fn(irq6_handler);
        idt[IRQ_BASE + 7].set_handler_fn(irq7_handler);
        idt[IRQ_BASE + 8].set_handler_fn(irq8_handler);
        idt[IRQ_BASE + 9].set_handler_fn(irq9_handler);
        idt[IRQ_BASE + 10].set_handler_fn(irq10_handler);
        idt[IRQ_BASE + 11].set_handler_fn(irq11_handler);
        idt[IRQ_BASE + 12].set_handler_fn(irq12_handler);
        idt[IRQ_BASE + 13].set_handler_fn(irq13_handler);
        idt[IRQ_BASE + 14].set_handler_fn(irq14_handler);
        idt[IRQ_BASE + 15].set_handler_fn(irq15_handler);

        // Everything past the IRQ range is spurious.
        for vector in 48..=255u16 {
            if vector as u8 != SYSCALL_VECTOR {
                idt[vector as u8].set_handler_fn(spurious_handler);
            }
        }

        // Syscall gate, reachable from ring 3.
        // SAFETY: syscall_entry is a naked stub that preserves all registers
        // and ends in iretq.
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(super::syscall::syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("DIVIDE ERROR", &stack_frame, None);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("INVALID OPCODE", &stack_frame, None);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    crate::println!("EXCEPTION: DOUBLE FAULT (code {:#x})", error_code);
    crate::println!("{:#?}", stack_frame);
    crate::arch::halt_forever();
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_exception("GENERAL PROTECTION FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let from_user = error_code.contains(PageFaultErrorCode::USER_MODE);

    crate::println!("EXCEPTION: PAGE FAULT ({:?})", error_code);
    crate::println!("Faulting address: {:?}", Cr2::read());
    crate::println!("{:#?}", stack_frame);

    if from_user {
        // An unhandled user-mode fault terminates the process as if it had
        // called exit(-1); the kernel carries on.
        crate::process::exit_current(-1);
    }

    fatal_exception("PAGE FAULT (kernel mode)", &stack_frame, None);
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
    // Unrecognised vector: ignore, per the dispatch contract.
}

/// Report an exception that has no registered handler and halt.
fn fatal_exception(name: &str, stack_frame: &InterruptStackFrame, code: Option<u64>) -> ! {
    crate::println!("EXCEPTION: {}", name);
    if let Some(code) = code {
        crate::println!("Error code: {:#x}", code);
    }
    crate::println!("{:#?}", stack_frame);
    crate::symbols::print_backtrace(stack_frame.instruction_pointer.as_u64());
    crate::arch::halt_forever();
}

/// End-of-interrupt notification for an IRQ vector, forwarded to the PIC.
pub fn end_of_interrupt(irq: u8) {
    pic::end_of_interrupt(IRQ_BASE + irq);
}
