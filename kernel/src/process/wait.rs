//! waitpid: collect exited children.
//!
//! A parent blocks until an eligible child becomes a zombie; collecting
//! the status removes the zombie from the table, releasing its last
//! kernel-side resources (the address-space root frame and kernel stack).
//! There is no timeout form.

use crate::{
    error::{KernelError, KernelResult},
    sched,
};

use super::{
    table::{with_table, Pid},
    ProcessState,
};

/// Outcome of one table scan.
enum ScanResult {
    /// A zombie was collected.
    Collected(Pid, i32),
    /// Children exist but none are zombies yet.
    MustWait,
}

fn scan(target: i64) -> KernelResult<ScanResult> {
    with_table(|t| {
        let me = t.current;
        let children = t.children_of(me);

        let eligible: alloc::vec::Vec<Pid> = children
            .into_iter()
            .filter(|&pid| target <= 0 || pid as i64 == target)
            .collect();
        if eligible.is_empty() {
            return Err(KernelError::NoChild);
        }

        for pid in eligible {
            let is_zombie = t.get(pid)?.state == ProcessState::Zombie;
            if is_zombie {
                let mut proc = t.remove(pid).ok_or(KernelError::NoProcess)?;
                let status = proc.exit_status;
                if let Some(space) = proc.address_space.take() {
                    // User half was torn down at exit; only the root
                    // frame remains.
                    space.release_root();
                }
                return Ok(ScanResult::Collected(pid, status));
            }
        }

        // Nothing collectable yet: go to sleep until a child exits.
        let current = t.current;
        let proc = t.current_proc_mut();
        proc.waiting_for_child = true;
        proc.state = ProcessState::Sleeping;
        proc.wake_tick = u64::MAX;
        t.sleeping.push(current);
        Ok(ScanResult::MustWait)
    })
}

/// Wait for a child to exit.
///
/// `target` < 1 waits for any child; a positive value waits for that
/// specific child. Returns the collected pid and writes the exit status
/// through `status_out`.
pub fn waitpid(target: i64, status_out: &mut i32, _options: u64) -> KernelResult<Pid> {
    loop {
        match scan(target) {
            Ok(ScanResult::Collected(pid, status)) => {
                with_table(|t| t.current_proc_mut().waiting_for_child = false);
                *status_out = status;
                return Ok(pid);
            }
            Ok(ScanResult::MustWait) => {
                sched::schedule();
                // Woken by an exiting child (or a spurious wake): rescan.
                with_table(|t| t.current_proc_mut().waiting_for_child = false);
            }
            Err(e) => {
                with_table(|t| t.current_proc_mut().waiting_for_child = false);
                return Err(e);
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, string::String};

    use super::*;
    use crate::process::{table, Process};

    #[test]
    fn waitpid_with_no_children_reports_nochild() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();
        let mut status = 0;
        assert_eq!(
            waitpid(-1, &mut status, 0).unwrap_err(),
            KernelError::NoChild
        );
    }

    #[test]
    fn waitpid_collects_zombie_child() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        with_table(|t| {
            let pid = t.alloc_pid();
            let mut child = Box::new(Process::new(pid, 0, String::from("dead")));
            child.state = ProcessState::Zombie;
            child.exit_status = 42;
            t.insert_ready(child);
            t.ready.retain(|&p| p != pid);
        });

        let mut status = 0;
        let pid = waitpid(-1, &mut status, 0).expect("collect zombie");
        assert_eq!(status, 42);

        // The zombie is gone from the table.
        with_table(|t| assert!(t.get(pid).is_err()));
    }

    #[test]
    fn waitpid_for_specific_child_ignores_others() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        let (zombie_a, zombie_b) = with_table(|t| {
            let a = t.alloc_pid();
            let mut pa = Box::new(Process::new(a, 0, String::from("a")));
            pa.state = ProcessState::Zombie;
            pa.exit_status = 1;
            t.insert_ready(pa);
            t.ready.retain(|&p| p != a);

            let b = t.alloc_pid();
            let mut pb = Box::new(Process::new(b, 0, String::from("b")));
            pb.state = ProcessState::Zombie;
            pb.exit_status = 2;
            t.insert_ready(pb);
            t.ready.retain(|&p| p != b);
            (a, b)
        });

        let mut status = 0;
        let collected = waitpid(zombie_b as i64, &mut status, 0).expect("collect b");
        assert_eq!(collected, zombie_b);
        assert_eq!(status, 2);
        // a is still collectable.
        let collected = waitpid(-1, &mut status, 0).expect("collect a");
        assert_eq!(collected, zombie_a);
        assert_eq!(status, 1);
    }
}
