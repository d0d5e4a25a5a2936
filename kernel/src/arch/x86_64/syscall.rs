//! int 0x80 system-call entry.
//!
//! The naked stub saves the full register file on the current kernel stack
//! (forming a [`SyscallFrame`]), shuffles the user's registers into the
//! SysV argument registers and calls into the portable dispatcher. The
//! user-side convention: ordinal in `rax`, arguments in `rdi`, `rsi`,
//! `rdx`; result returned in `rax`, negative errno on failure.

use core::arch::naked_asm;

/// Register file captured at syscall entry, in stack order.
///
/// The first fifteen fields are pushed by the stub (rax lowest); the last
/// five are the CPU-pushed interrupt frame. `fork` copies this frame to
/// give the child an identical user state, and `exec` rewrites it so the
/// iretq lands in the fresh image.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Naked interrupt stub installed at vector 0x80.
///
/// # Safety
/// Entered only by the CPU through the IDT gate.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        // Save the register file; rax ends up at [rsp].
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdi",
        "push rsi",
        "push rdx",
        "push rcx",
        "push rbx",
        "push rax",
        // Marshal: ordinal (saved rax) and the user's rdi/rsi/rdx.
        "mov rdi, [rsp]",
        "mov rsi, [rsp + 40]",
        "mov rdx, [rsp + 32]",
        "mov rcx, [rsp + 24]",
        "mov r8, rsp",
        "call {dispatch}",
        // Result replaces the saved rax.
        "mov [rsp], rax",
        "pop rax",
        "pop rbx",
        "pop rcx",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        dispatch = sym syscall_dispatch_shim,
    )
}

/// C-ABI shim between the naked stub and the portable dispatcher.
extern "C" fn syscall_dispatch_shim(
    ordinal: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    frame: *mut SyscallFrame,
) -> i64 {
    // SAFETY: the stub passes a pointer into the current kernel stack,
    // valid for the duration of the call.
    let frame = unsafe { &mut *frame };
    crate::syscall::dispatch(ordinal, arg1, arg2, arg3, frame)
}
