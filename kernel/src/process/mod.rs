//! Process management.
//!
//! A process is a pid, a parent, an address space, an image descriptor, a
//! file-descriptor table and a scheduling state. Pid 0 is the kernel idle
//! flow; every other process is created by [`fork`](fork::fork) and
//! replaced in place by [`exec`](exec::exec). Exit turns a process into a
//! zombie until its parent collects it with
//! [`waitpid`](wait::waitpid); collection reparents orphans to the init
//! process.

pub mod exec;
pub mod fork;
pub mod table;
pub mod wait;

pub use fork::fork;
pub use exec::exec;
pub use table::{with_table, Pid, INIT_PID};
pub use wait::waitpid;

use alloc::{string::String, vec, vec::Vec};

use crate::{
    error::KernelResult,
    fs::FdTable,
    mm::AddressSpace,
};

/// Kernel stack size per process (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, waiting in the ready queue.
    Ready,
    /// Currently on the CPU.
    Running,
    /// Off the queues until its wake condition fires.
    Sleeping,
    /// Exited, waiting for the parent to collect the status.
    Zombie,
}

/// Loaded-image layout of a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessImage {
    /// Lowest mapped virtual address of the image.
    pub entry: u64,
    /// Bytes from `entry` to the end of the highest segment.
    pub size: u64,
    /// Start of the heap region placed above the image.
    pub heap: u64,
    /// Current top of the in-use heap.
    pub heap_actual: u64,
}

/// One process.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    pub state: ProcessState,
    /// `None` for the kernel idle flow, which runs on the boot tables.
    pub address_space: Option<AddressSpace>,
    pub image: ProcessImage,
    pub fds: FdTable,
    pub cwd: String,
    /// Tick at which a sleeper becomes ready (`u64::MAX` = explicit wake).
    pub wake_tick: u64,
    /// Set while blocked in waitpid so exit can wake the right parent.
    pub waiting_for_child: bool,
    pub exit_status: i32,
    /// Suspended kernel execution state.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub context: crate::arch::x86_64::context::Context,
    /// Backing storage for this process's kernel stack.
    kernel_stack: Vec<u8>,
}

impl Process {
    /// Build a process shell around an existing kernel flow (pid 0) or as
    /// the target of fork.
    pub fn new(pid: Pid, parent: Pid, name: String) -> Self {
        Self {
            pid,
            parent,
            name,
            state: ProcessState::Ready,
            address_space: None,
            image: ProcessImage::default(),
            fds: FdTable::new(),
            cwd: String::from("/"),
            wake_tick: 0,
            waiting_for_child: false,
            exit_status: 0,
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            context: crate::arch::x86_64::context::Context::new(),
            kernel_stack: Vec::new(),
        }
    }

    /// Allocate this process's kernel stack and return its top address.
    pub fn alloc_kernel_stack(&mut self) -> u64 {
        if self.kernel_stack.is_empty() {
            self.kernel_stack = vec![0u8; KERNEL_STACK_SIZE];
        }
        self.kernel_stack_top()
    }

    /// One past the highest usable byte of the kernel stack, 16-aligned.
    pub fn kernel_stack_top(&self) -> u64 {
        let base = self.kernel_stack.as_ptr() as u64;
        (base + self.kernel_stack.len() as u64) & !0xF
    }
}

/// Pid of the process currently on the CPU.
pub fn current_pid() -> Pid {
    with_table(|t| t.current)
}

/// Working directory of the current process.
pub fn current_cwd() -> String {
    with_table(|t| t.current_proc().cwd.clone())
}

/// Change the current process's working directory; the target must
/// resolve to a directory.
pub fn set_cwd(path: &str) -> KernelResult<()> {
    let cwd = current_cwd();
    let canonical = crate::fs::canonicalize(&cwd, path);
    let node = crate::fs::kopen(&canonical, crate::fs::OpenFlags::empty())?;
    let is_dir = node.is_dir();
    node.close();
    if !is_dir {
        return Err(crate::error::KernelError::NotDirectory);
    }
    with_table(|t| t.current_proc_mut().cwd = canonical);
    Ok(())
}

/// Terminate the current process, waking a waiting parent.
///
/// Also the landing path for unhandled user-mode faults, which terminate
/// the process as if it had called `exit(-1)`.
pub fn exit_current(status: i32) -> ! {
    crate::sched::exit_current(status)
}
