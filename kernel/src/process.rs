//! Process manager
//!
//! The task table and the per-task pieces the memory core needs: the page
//! directory root, the ordered VMA list, resident-set and fault accounting,
//! and fatal-signal delivery. Scheduling proper lives outside the core.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::memory::frame::FrameNo;
use crate::memory::vma::VmaId;

/// Process ID type
pub type Pid = u32;

/// The boot task ("swapper"). Its page tables are never torn down.
pub const PID_BOOT: Pid = 0;

/// Untrappable kill signal, delivered on out-of-memory and bad-page faults.
pub const SIGKILL: u32 = 9;

/// Segmentation fault signal, delivered on bad-address faults.
pub const SIGSEGV: u32 = 11;

/// Per-task state owned by the memory core.
#[derive(Debug)]
pub struct Task {
    /// Process ID
    pub pid: Pid,
    /// Task name (diagnostics only)
    pub name: String,
    /// Frame holding the top-level page directory
    pub root: FrameNo,
    /// VMA ids, kept sorted by start address, pairwise disjoint
    pub vmas: Vec<VmaId>,
    /// Resident set size in pages
    pub rss: usize,
    /// Minor faults (no I/O)
    pub min_flt: u64,
    /// Major faults (swap or backing-store I/O)
    pub maj_flt: u64,
    /// Top of the stack region; shm attaches keep a guard band below it
    pub start_stack: u64,
    /// Pending fatal signal, observed on return to user mode
    pub pending_signal: Option<u32>,
    /// Effective uid/gid for IPC permission checks
    pub euid: u16,
    pub egid: u16,
}

impl Task {
    pub fn new(pid: Pid, name: &str, root: FrameNo) -> Self {
        Self {
            pid,
            name: String::from(name),
            root,
            vmas: Vec::new(),
            rss: 0,
            min_flt: 0,
            maj_flt: 0,
            start_stack: crate::memory::DEFAULT_STACK_TOP,
            pending_signal: None,
            euid: 0,
            egid: 0,
        }
    }

    /// Superuser check for privileged shmctl commands.
    pub fn suser(&self) -> bool {
        self.euid == 0
    }
}

/// Deliver a signal to a task. The core only ever sends fatal signals
/// (SIGKILL on OOM, SIGSEGV on corrupt page structures); the first one
/// sticks.
pub fn send_sig(sig: u32, task: &mut Task) {
    if task.pending_signal.is_none() {
        task.pending_signal = Some(sig);
    }
    log::warn!("[PROC] signal {} for pid {} ({})", sig, task.pid, task.name);
}

/// The task table. Pid 0 is the boot task.
pub struct TaskTable {
    tasks: BTreeMap<Pid, Task>,
    next_pid: Pid,
}

impl TaskTable {
    pub fn new() -> Self {
        Self { tasks: BTreeMap::new(), next_pid: 1 }
    }

    pub fn insert_boot(&mut self, task: Task) {
        assert_eq!(task.pid, PID_BOOT);
        self.tasks.insert(PID_BOOT, task);
    }

    pub fn spawn(&mut self, name: &str, root: FrameNo) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.tasks.insert(pid, Task::new(pid, name, root));
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid)
    }

    /// Remove a dead task's record. The caller must have torn down its
    /// address space first.
    pub fn remove(&mut self, pid: Pid) -> Option<Task> {
        self.tasks.remove(&pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_assigns_increasing_pids() {
        let mut table = TaskTable::new();
        table.insert_boot(Task::new(PID_BOOT, "swapper", 0));
        let a = table.spawn("a", 1);
        let b = table.spawn("b", 2);
        assert!(b > a);
        assert_eq!(table.get(a).unwrap().name, "a");
    }

    #[test]
    fn first_fatal_signal_sticks() {
        let mut task = Task::new(3, "victim", 0);
        send_sig(SIGSEGV, &mut task);
        send_sig(SIGKILL, &mut task);
        assert_eq!(task.pending_signal, Some(SIGSEGV));
    }
}
