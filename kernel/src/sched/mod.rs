//! Scheduler: cooperative round-robin driven by the timer tick.
//!
//! Ready processes rotate through a queue; the timer tick wakes due
//! sleepers and preempts the running process when another is ready. Kernel
//! code runs to a natural yield point (blocking syscall, explicit sleep,
//! return to user); the idle path is a `hlt` loop in pid 0.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::process::{
    table::{self, with_table, IDLE_PID},
    Pid, ProcessState,
};

/// Set once the first handoff has happened; the tick ignores preemption
/// before that.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Install the process table, hook the timer and mark pid 0 running.
pub fn init() {
    table::init();
    crate::timer::set_tick_handler(on_tick);
    log::info!("scheduler installed (round-robin, tick driven)");
}

/// Begin scheduling: from here on the tick may preempt.
pub fn start() {
    STARTED.store(true, Ordering::Release);
}

/// Timer-tick entry: wake due sleepers, then round-robin preempt.
fn on_tick(now: u64) {
    with_table(|t| t.wake_due_sleepers(now));

    if STARTED.load(Ordering::Acquire) {
        let should_switch = with_table(|t| !t.ready.is_empty());
        if should_switch {
            schedule();
        }
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    schedule();
}

/// Put the current process to sleep until `wake_tick` (or an explicit
/// wake), then run something else.
pub fn sleep_until(wake_tick: u64) {
    with_table(|t| {
        let current = t.current;
        let proc = t.current_proc_mut();
        proc.state = ProcessState::Sleeping;
        proc.wake_tick = wake_tick;
        t.sleeping.push(current);
    });
    schedule();
}

/// Sleep for `ms` milliseconds. Wakes at the absolute tick or later,
/// never earlier.
pub fn sleep_ms(ms: u64) {
    let wake = crate::timer::get_ticks() + crate::timer::ms_to_ticks(ms);
    sleep_until(wake);
}

/// Terminate the current process: close its descriptors, reparent its
/// children, wake a parent blocked in waitpid, then switch away forever.
pub fn exit_current(status: i32) -> ! {
    let parent_to_wake = with_table(|t| {
        let current = t.current;
        let proc = t.current_proc_mut();
        proc.state = ProcessState::Zombie;
        proc.exit_status = status;
        proc.fds.close_all();
        let parent = proc.parent;

        t.reparent_children(current);

        match t.get(parent) {
            Ok(p) if p.waiting_for_child => Some(parent),
            _ => None,
        }
    });

    // Tear down the user half while still able to reach the tables; the
    // root frame is released when the zombie is collected.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let root = with_table(|t| {
            t.current_proc_mut()
                .address_space
                .as_mut()
                .map(|space| {
                    space.clear_user_half();
                    space.root()
                })
        });
        // Run the rest of this exit on the boot tables so the dying
        // process's root can be freed by the reaper.
        if root.is_some() {
            crate::mm::AddressSpace::from_root(crate::mm::kernel_root()).switch_to();
        }
    }

    if let Some(parent) = parent_to_wake {
        with_table(|t| t.wake(parent));
    }

    log::debug!("process exited with status {}", status);
    schedule();

    // A zombie is never rescheduled; on the host (tests) there is nothing
    // to switch to either way.
    unreachable!("zombie process resumed");
}

/// Pick the next ready process and switch to it.
///
/// The table lock is released before the actual context switch; the
/// pointers stay valid because processes are boxed and only removed by the
/// reaper, which cannot run while either side is mid-switch.
pub fn schedule() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use crate::arch::x86_64::{context, gdt};

        let switch = with_table(|t| {
            let old_pid = t.current;

            // Requeue the outgoing process if it is still runnable.
            let old_state = t.current_proc().state;
            let next = match t.ready.pop_front() {
                Some(pid) => pid,
                None => {
                    if old_state == ProcessState::Running {
                        // Nothing else to run; keep going.
                        return None;
                    }
                    IDLE_PID
                }
            };
            if next == old_pid {
                return None;
            }
            if old_state == ProcessState::Running && old_pid != IDLE_PID {
                t.current_proc_mut().state = ProcessState::Ready;
                t.ready.push_back(old_pid);
            } else if old_state == ProcessState::Running {
                t.current_proc_mut().state = ProcessState::Ready;
            }

            t.current = next;
            let old_ctx = {
                let old = t.get_mut(old_pid).expect("outgoing process");
                &mut old.context as *mut context::Context
            };
            let new = t.get_mut(next).expect("incoming process");
            new.state = ProcessState::Running;
            let new_ctx = &new.context as *const context::Context;
            let kstack_top = if next == IDLE_PID {
                0
            } else {
                new.kernel_stack_top()
            };
            let space_root = new.address_space.as_ref().map(|s| s.root());
            Some((old_ctx, new_ctx, kstack_top, space_root))
        });

        if let Some((old_ctx, new_ctx, kstack_top, space_root)) = switch {
            if kstack_top != 0 {
                gdt::set_kernel_stack(kstack_top);
            }
            if let Some(root) = space_root {
                crate::mm::AddressSpace::from_root(root).switch_to();
            }
            // SAFETY: both contexts live in boxed processes that outlive
            // the switch; see the function comment.
            unsafe { context::switch_context(old_ctx, new_ctx) };
        }
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        // Host builds have no context switching; state transitions above
        // are still exercised by the unit tests.
        with_table(|t| {
            if let Some(next) = t.ready.pop_front() {
                let old = t.current;
                if t.current_proc().state == ProcessState::Running && old != IDLE_PID {
                    t.current_proc_mut().state = ProcessState::Ready;
                    t.ready.push_back(old);
                }
                t.current = next;
                let _ = t.get_mut(next).map(|p| p.state = ProcessState::Running);
            }
        });
    }
}

/// Wake a specific process (device drivers, waitpid).
pub fn wake(pid: Pid) {
    with_table(|t| t.wake(pid));
}

/// The idle loop pid 0 falls into once boot is complete.
pub fn idle_loop() -> ! {
    loop {
        crate::arch::halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, string::String};

    use super::*;
    use crate::process::Process;

    #[test]
    fn round_robin_rotates_ready_queue() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        with_table(|t| {
            for pid in [1u32, 2] {
                let p = Box::new(Process::new(pid, 0, String::from("p")));
                t.insert_ready(p);
            }
        });

        schedule();
        assert_eq!(crate::process::current_pid(), 1);
        schedule();
        assert_eq!(crate::process::current_pid(), 2);
        // 1 was requeued behind 2.
        schedule();
        assert_eq!(crate::process::current_pid(), 1);
    }

    #[test]
    fn sleeping_process_skips_rotation_until_woken() {
        let _g = crate::fs::TEST_LOCK.lock();
        table::reset();

        with_table(|t| {
            let mut p = Box::new(Process::new(1, 0, String::from("sleeper")));
            p.state = ProcessState::Sleeping;
            p.wake_tick = 50;
            t.insert_ready(p);
            t.ready.retain(|&pid| pid != 1);
            t.sleeping.push(1);
        });

        with_table(|t| t.wake_due_sleepers(10));
        assert_eq!(with_table(|t| t.ready.len()), 0);
        with_table(|t| t.wake_due_sleepers(50));
        assert_eq!(with_table(|t| t.ready.len()), 1);
    }
}
