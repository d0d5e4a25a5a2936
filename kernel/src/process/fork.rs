//! fork: duplicate the current process.
//!
//! The child gets a fresh pid, a deep-copied user address space, a cloned
//! file-descriptor table (each node gains one borrow), and the parent's
//! working directory and image layout. The child's kernel stack is primed
//! with a copy of the parent's syscall frame whose `rax` is zero, so the
//! child resumes at the fork call site returning 0 while the parent
//! returns the child's pid.

use alloc::boxed::Box;

use crate::error::KernelResult;

use super::{
    table::{with_table, Pid},
    Process,
};

/// Portable part of fork: build the child as a copy of the current
/// process and register it ready.
fn duplicate_current() -> KernelResult<(Pid, *mut Process)> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    let address_space = {
        // Deep copy outside the table lock: copying may allocate many
        // frames.
        let parent_space = with_table(|t| {
            t.current_proc().address_space.as_ref().map(|s| s.root())
        });
        match parent_space {
            Some(root) => Some(crate::mm::AddressSpace::from_root(root).clone_user()?),
            None => None,
        }
    };

    with_table(|t| {
        let parent = t.current_proc();
        let parent_pid = parent.pid;
        let name = parent.name.clone();
        let fds = parent.fds.clone_for_fork();
        let cwd = parent.cwd.clone();
        let image = parent.image;

        let pid = t.alloc_pid();
        let mut child = Box::new(Process::new(pid, parent_pid, name));
        child.fds = fds;
        child.cwd = cwd;
        child.image = image;
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            child.address_space = address_space;
        }

        let ptr = child.as_mut() as *mut Process;
        t.insert_ready(child);
        Ok((pid, ptr))
    })
}

/// Fork the current process. Returns the child's pid (the child itself
/// returns 0 out of the copied frame).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn fork(frame: &crate::arch::x86_64::syscall::SyscallFrame) -> KernelResult<Pid> {
    use crate::arch::x86_64::{syscall::SyscallFrame, usermode};

    let (pid, child_ptr) = duplicate_current()?;

    // Prime the child's kernel stack: a copy of the caller's register
    // frame (rax forced to 0) and a context that restores it.
    //
    // SAFETY: the child was just inserted and cannot run until this
    // function returns; the raw pointer stays valid because processes are
    // boxed in the table.
    unsafe {
        let child = &mut *child_ptr;
        let stack_top = child.alloc_kernel_stack();

        let frame_size = core::mem::size_of::<SyscallFrame>() as u64;
        let frame_addr = (stack_top - frame_size) & !0xF;
        let mut child_frame = *frame;
        child_frame.rax = 0;
        (frame_addr as *mut SyscallFrame).write(child_frame);

        child
            .context
            .prime(frame_addr, usermode::fork_child_entry, frame_addr);
    }

    Ok(pid)
}

/// Host rendition without a register frame; exercises everything but the
/// stack priming.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn fork() -> KernelResult<Pid> {
    let (pid, _child) = duplicate_current()?;
    Ok(pid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::fs::{
        node::{NodeKind, NodeOps, Refcount},
        FileDescriptor, Node, OpenFlags,
    };
    use crate::process::table;

    struct NullOps;
    impl NodeOps for NullOps {}

    #[test]
    fn fork_clones_fd_table_and_bumps_refcounts() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        let node = Arc::new(Node::new(
            "shared".into(),
            NodeKind::File,
            1,
            0o644,
            Arc::new(NullOps),
        ));
        node.open(OpenFlags::empty());

        with_table(|t| {
            t.current_proc_mut()
                .fds
                .set(
                    3,
                    FileDescriptor {
                        node: node.clone(),
                        offset: 7,
                        mode: OpenFlags::RDWR,
                    },
                )
                .expect("install fd");
        });

        let parent_pid = crate::process::current_pid();
        let child_pid = fork().expect("fork");
        assert_ne!(child_pid, parent_pid);

        // The child's fd 3 references the same node, and the node gained
        // exactly one borrow.
        with_table(|t| {
            let child = t.get(child_pid).expect("child exists");
            let fd = child.fds.get(3).expect("child fd 3");
            assert!(Arc::ptr_eq(&fd.node, &node));
            assert_eq!(fd.offset, 7);
            assert_eq!(child.parent, parent_pid);
        });
        assert_eq!(node.refcount(), Refcount::Borrowed(2));
    }

    #[test]
    fn forked_child_is_ready() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        let child_pid = fork().expect("fork");
        with_table(|t| {
            assert!(t.ready.contains(&child_pid));
            assert_eq!(
                t.get(child_pid).unwrap().state,
                crate::process::ProcessState::Ready
            );
        });
    }
}
