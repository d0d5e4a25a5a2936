//! exec: replace the current process image in place.
//!
//! Tears down the user half of the address space, loads the new ELF,
//! resets file descriptors 3 and up, and rewrites the saved register
//! frame so the return to user mode lands at the fresh entry point with
//! `argc`/`argv` in the ABI argument registers. The pid is kept.

use alloc::string::String;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use alloc::vec::Vec;

use crate::error::KernelResult;

use super::table::with_table;

/// Replace the current image with the executable at `path`.
///
/// On success the rewritten `frame` makes the syscall return jump into the
/// new image; exec itself never "returns" to the old one.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn exec(
    path: &str,
    argv: &[String],
    envp: &[String],
    frame: &mut crate::arch::x86_64::syscall::SyscallFrame,
) -> KernelResult<()> {
    use crate::mm::AddressSpace;

    // Resolve relative to the caller's working directory.
    let cwd = super::current_cwd();
    let canonical = crate::fs::canonicalize(&cwd, path);

    // Probe the image before destroying the old one.
    let data = crate::fs::read_file(&canonical)?;
    crate::elf::validate(&data)?;
    drop(data);

    // From here on the old image is unrecoverable.
    let mut space = AddressSpace::current();
    space.clear_user_half();

    let loaded = crate::elf::load(&canonical, argv, envp)?;

    with_table(|t| {
        let proc = t.current_proc_mut();
        proc.image = loaded.image;
        proc.name = canonical.clone();
        proc.fds.close_from(3);
    });

    // Rewrite the return frame: fresh registers, new rip/rsp, argc/argv
    // in rdi/rsi per the ABI.
    let (cs, ss) = {
        let sel = crate::arch::x86_64::gdt::selectors();
        (sel.user_code.0 as u64, sel.user_data.0 as u64)
    };
    *frame = crate::arch::x86_64::syscall::SyscallFrame {
        rax: 0,
        rbx: 0,
        rcx: 0,
        rdx: loaded.envp_ptr,
        rsi: loaded.argv_ptr,
        rdi: loaded.argc,
        rbp: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rip: loaded.entry_point,
        cs,
        rflags: 0x202,
        rsp: loaded.user_stack_top,
        ss,
    };

    Ok(())
}

/// Host stub so the syscall surface typechecks in unit tests; real exec
/// needs an address space to rebuild.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn exec(path: &str, _argv: &[String], _envp: &[String]) -> KernelResult<()> {
    let cwd = super::current_cwd();
    let canonical = crate::fs::canonicalize(&cwd, path);
    let data = crate::fs::read_file(&canonical)?;
    crate::elf::validate(&data)?;
    with_table(|t| {
        let proc = t.current_proc_mut();
        proc.name = canonical;
        proc.fds.close_from(3);
    });
    Ok(())
}

/// Create the first user process: fork-from-kernel into `path`.
///
/// The new process starts in a kernel trampoline that builds its address
/// space, loads the ELF and drops to ring 3. This is the boot handoff
/// into the user-space shell.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn spawn_init(path: &str, argv: &[&str]) -> KernelResult<super::Pid> {
    use alloc::boxed::Box;
    use alloc::string::ToString;

    use crate::mm::AddressSpace;

    let space = AddressSpace::new_user()?;

    let args: Vec<String> = core::iter::once(path.to_string())
        .chain(argv.iter().map(|a| a.to_string()))
        .collect();
    let payload = Box::new(InitPayload {
        path: path.to_string(),
        argv: args,
    });

    // Wire stdio to the console device before touching the table so the
    // VFS lock is never taken under the scheduler lock.
    let console = crate::fs::kopen("/dev/console", crate::fs::OpenFlags::RDWR).ok();

    with_table(|t| {
        let pid = t.alloc_pid();
        let mut proc = Box::new(super::Process::new(pid, super::table::IDLE_PID, path.to_string()));
        proc.address_space = Some(space);

        if let Some(console) = &console {
            for fd in 0..3 {
                let _ = proc.fds.set(
                    fd,
                    crate::fs::FileDescriptor {
                        node: console.clone_ref(),
                        offset: 0,
                        mode: crate::fs::OpenFlags::RDWR,
                    },
                );
            }
            console.close();
        }

        let stack_top = proc.alloc_kernel_stack();
        // SAFETY: the stack was just allocated and is exclusively ours.
        unsafe {
            proc.context
                .prime(stack_top, init_entry, Box::into_raw(payload) as u64);
        }
        t.insert_ready(proc);
        Ok(pid)
    })
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
struct InitPayload {
    path: String,
    argv: Vec<String>,
}

/// Kernel-side entry of the init process: load the image, enter ring 3.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" fn init_entry(payload: u64) -> ! {
    use alloc::boxed::Box;

    // SAFETY: the pointer was produced by Box::into_raw in spawn_init.
    let payload = unsafe { Box::from_raw(payload as *mut InitPayload) };

    let loaded = crate::elf::load(&payload.path, &payload.argv, &[])
        .expect("init: failed to load user image");

    with_table(|t| {
        t.current_proc_mut().image = loaded.image;
    });

    log::info!(
        "init: entering {} at {:#x}",
        payload.path,
        loaded.entry_point
    );
    drop(payload);

    // SAFETY: the image and stack were just mapped into this process's
    // address space, which is the active one.
    unsafe {
        crate::arch::x86_64::usermode::enter_user(
            loaded.entry_point,
            loaded.user_stack_top,
            loaded.argc,
            loaded.argv_ptr,
        )
    }
}
