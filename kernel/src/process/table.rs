//! The process table.
//!
//! One IRQ-safe lock guards the whole table: the pid map, the ready queue
//! and the sleep list. The lock is held only across state transitions,
//! never across I/O or a context switch.

use alloc::{boxed::Box, collections::BTreeMap, collections::VecDeque, string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

use super::{Process, ProcessState};

/// Process identifier.
pub type Pid = u32;

/// Pid of the kernel idle flow.
pub const IDLE_PID: Pid = 0;

/// Pid the first forked process receives; orphans are reparented to it.
pub const INIT_PID: Pid = 1;

/// The process table plus the two schedulable collections.
pub struct ProcessTable {
    procs: BTreeMap<Pid, Box<Process>>,
    /// Round-robin ready queue (never contains the idle pid).
    pub ready: VecDeque<Pid>,
    /// Sleepers keyed by wake tick.
    pub sleeping: Vec<Pid>,
    /// Pid currently on the CPU.
    pub current: Pid,
    /// Monotonically increasing pid counter.
    next_pid: Pid,
}

impl ProcessTable {
    fn new() -> Self {
        let mut procs = BTreeMap::new();
        let mut idle = Box::new(Process::new(IDLE_PID, IDLE_PID, String::from("idle")));
        idle.state = ProcessState::Running;
        procs.insert(IDLE_PID, idle);

        Self {
            procs,
            ready: VecDeque::new(),
            sleeping: Vec::new(),
            current: IDLE_PID,
            next_pid: INIT_PID,
        }
    }

    /// Allocate the next pid.
    pub fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Insert a process and queue it as ready.
    pub fn insert_ready(&mut self, proc: Box<Process>) {
        let pid = proc.pid;
        self.procs.insert(pid, proc);
        self.ready.push_back(pid);
    }

    pub fn get(&self, pid: Pid) -> KernelResult<&Process> {
        self.procs
            .get(&pid)
            .map(|p| p.as_ref())
            .ok_or(KernelError::NoProcess)
    }

    pub fn get_mut(&mut self, pid: Pid) -> KernelResult<&mut Process> {
        self.procs
            .get_mut(&pid)
            .map(|p| p.as_mut())
            .ok_or(KernelError::NoProcess)
    }

    /// The process currently on the CPU.
    pub fn current_proc(&self) -> &Process {
        self.procs.get(&self.current).expect("current process vanished")
    }

    pub fn current_proc_mut(&mut self) -> &mut Process {
        self.procs
            .get_mut(&self.current)
            .expect("current process vanished")
    }

    /// Remove a process outright (zombie collection).
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        self.ready.retain(|&p| p != pid);
        self.sleeping.retain(|&p| p != pid);
        self.procs.remove(&pid)
    }

    /// Children of `pid`.
    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        self.procs
            .values()
            .filter(|p| p.parent == pid && p.pid != pid)
            .map(|p| p.pid)
            .collect()
    }

    /// Hand `pid`'s children to the init process (or idle before init
    /// exists).
    pub fn reparent_children(&mut self, pid: Pid) {
        let new_parent = if self.procs.contains_key(&INIT_PID) {
            INIT_PID
        } else {
            IDLE_PID
        };
        for proc in self.procs.values_mut() {
            if proc.parent == pid && proc.pid != pid {
                proc.parent = new_parent;
            }
        }
    }

    /// Move every due sleeper back to the ready queue.
    pub fn wake_due_sleepers(&mut self, now: u64) {
        let mut woken: Vec<Pid> = Vec::new();
        self.sleeping.retain(|&pid| {
            let due = self
                .procs
                .get(&pid)
                .map(|p| p.wake_tick <= now)
                .unwrap_or(true);
            if due {
                woken.push(pid);
            }
            !due
        });
        for pid in woken {
            if let Some(proc) = self.procs.get_mut(&pid) {
                proc.state = ProcessState::Ready;
                self.ready.push_back(pid);
            }
        }
    }

    /// Wake one specific sleeper (waitpid wakeups).
    pub fn wake(&mut self, pid: Pid) {
        if let Some(proc) = self.procs.get_mut(&pid) {
            if proc.state == ProcessState::Sleeping {
                proc.state = ProcessState::Ready;
                self.sleeping.retain(|&p| p != pid);
                self.ready.push_back(pid);
            }
        }
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

/// Global process table.
static PROCESS_TABLE: IrqSpinLock<Option<ProcessTable>> = IrqSpinLock::new(None);

/// Install the table with the idle process as pid 0. Idempotent so tests
/// can re-enter; a live kernel calls it once.
pub fn init() {
    let mut guard = PROCESS_TABLE.lock();
    if guard.is_none() {
        *guard = Some(ProcessTable::new());
    }
}

/// Reset the table to just the idle process (test support).
#[cfg(all(test, not(target_os = "none")))]
pub fn reset() {
    *PROCESS_TABLE.lock() = Some(ProcessTable::new());
}

/// Run `f` with the process table locked.
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    let mut guard = PROCESS_TABLE.lock();
    let table = guard.as_mut().expect("process table not initialized");
    f(table)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, string::String};

    use super::*;

    #[test]
    fn pids_are_monotonic() {
        let mut table = ProcessTable::new();
        let a = table.alloc_pid();
        let b = table.alloc_pid();
        assert_eq!(a, INIT_PID);
        assert!(b > a);
    }

    #[test]
    fn reparenting_moves_orphans_to_init() {
        let mut table = ProcessTable::new();
        let init = Box::new(Process::new(INIT_PID, IDLE_PID, String::from("init")));
        table.insert_ready(init);
        let parent_pid = table.alloc_pid();
        table.insert_ready(Box::new(Process::new(
            parent_pid,
            INIT_PID,
            String::from("parent"),
        )));
        let child_pid = table.alloc_pid();
        table.insert_ready(Box::new(Process::new(
            child_pid,
            parent_pid,
            String::from("child"),
        )));

        table.reparent_children(parent_pid);
        table.remove(parent_pid);
        assert_eq!(table.get(child_pid).unwrap().parent, INIT_PID);
    }

    #[test]
    fn sleepers_wake_in_tick_order() {
        let mut table = ProcessTable::new();
        for (pid, wake) in [(10u32, 5u64), (11, 3), (12, 100)] {
            let mut p = Box::new(Process::new(pid, IDLE_PID, String::from("s")));
            p.state = ProcessState::Sleeping;
            p.wake_tick = wake;
            table.procs.insert(pid, p);
            table.sleeping.push(pid);
        }

        table.wake_due_sleepers(4);
        assert_eq!(table.ready.len(), 1);
        assert_eq!(table.get(11).unwrap().state, ProcessState::Ready);
        assert_eq!(table.get(10).unwrap().state, ProcessState::Sleeping);

        table.wake_due_sleepers(10);
        assert_eq!(table.ready.len(), 2);
        assert_eq!(table.get(12).unwrap().state, ProcessState::Sleeping);
    }

    #[test]
    fn remove_clears_queues() {
        let mut table = ProcessTable::new();
        let pid = table.alloc_pid();
        table.insert_ready(Box::new(Process::new(pid, IDLE_PID, String::from("x"))));
        assert!(table.ready.contains(&pid));
        table.remove(pid);
        assert!(!table.ready.contains(&pid));
        assert!(table.get(pid).is_err());
    }
}
