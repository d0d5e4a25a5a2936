//! Ring-3 entry.
//!
//! Two ways into user mode: [`enter_user`] builds a fresh iretq frame for a
//! newly loaded image (argc/argv in the SysV argument registers), and
//! [`user_frame_return`] restores a captured [`SyscallFrame`] — the path a
//! forked child takes so it resumes at the fork call site.

use core::arch::{asm, naked_asm};

use super::{gdt, syscall::SyscallFrame};

/// RFLAGS for user entry: reserved bit 1 plus IF.
const USER_RFLAGS: u64 = 0x202;

/// Enter a fresh user image. Does not return.
///
/// # Safety
/// `entry` must point at mapped, executable user code and `user_stack` at a
/// mapped, writable user stack; the current address space must be the
/// process's own and the TSS must already carry its kernel stack.
pub unsafe fn enter_user(entry: u64, user_stack: u64, argc: u64, argv: u64) -> ! {
    let sel = gdt::selectors();
    let user_cs = sel.user_code.0 as u64;
    let user_ss = sel.user_data.0 as u64;

    // SAFETY: builds the five-word iretq frame on the current kernel stack;
    // the caller guarantees the target addresses are valid user mappings.
    unsafe {
        asm!(
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) user_ss,
            rsp = in(reg) user_stack,
            rflags = in(reg) USER_RFLAGS,
            cs = in(reg) user_cs,
            rip = in(reg) entry,
            in("rdi") argc,
            in("rsi") argv,
            options(noreturn),
        )
    }
}

/// Restore a saved register frame and iretq back to ring 3.
///
/// # Safety
/// `frame` must point at a complete, correctly laid out [`SyscallFrame`]
/// whose segment selectors and user addresses are valid in the current
/// address space.
#[unsafe(naked)]
pub unsafe extern "C" fn user_frame_return(frame: *const SyscallFrame, user_ds: u64) -> ! {
    naked_asm!(
        "mov ds, si",
        "mov es, si",
        "mov rsp, rdi",
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
    )
}

/// Kernel-side entry for a forked child: restores the copied syscall frame.
pub extern "C" fn fork_child_entry(frame_ptr: u64) -> ! {
    let user_ds = gdt::selectors().user_data.0 as u64;
    // SAFETY: fork placed a complete frame copy at `frame_ptr` on this
    // task's own kernel stack.
    unsafe { user_frame_return(frame_ptr as *const SyscallFrame, user_ds) }
}
