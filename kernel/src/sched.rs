//! Suspend/wake primitive
//!
//! The core assumes one CPU and one runnable execution unit in kernel mode,
//! so a "sleep" is a cooperative suspension: the sleeper re-checks its
//! condition in a loop and another task runs in between. Wait channels only
//! carry the bookkeeping (who slept, who woke) plus signal cancellation for
//! interruptible sleeps.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::process::Task;

/// How a sleeper wants to be treated while suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepMode {
    /// Short waits (page I/O). Signals are ignored.
    Uninterruptible,
    /// Long waits (memory pressure). A pending signal aborts the sleep.
    Interruptible,
}

/// Outcome of a sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeResult {
    Woken,
    /// A signal arrived during an interruptible sleep. The caller must tear
    /// down any structural state it owns before propagating the error.
    Interrupted,
}

/// A wake-all wait channel. Sleepers never queue payloads; they re-check
/// the guarded condition after every wake.
pub struct WaitChannel {
    name: &'static str,
    sleeps: AtomicU64,
    wakes: AtomicU64,
}

impl WaitChannel {
    pub const fn new(name: &'static str) -> Self {
        Self { name, sleeps: AtomicU64::new(0), wakes: AtomicU64::new(0) }
    }

    /// Suspend the calling task until the next wake. With only one runnable
    /// execution unit the suspension itself is a yield point; the caller's
    /// re-check loop provides the actual blocking behavior.
    pub fn sleep_on(&self, mode: SleepMode, task: Option<&Task>) -> WakeResult {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
        if mode == SleepMode::Interruptible {
            if let Some(task) = task {
                if task.pending_signal.is_some() {
                    log::debug!("[SCHED] sleep on {} interrupted by signal", self.name);
                    return WakeResult::Interrupted;
                }
            }
        }
        WakeResult::Woken
    }

    /// Wake every sleeper on the channel.
    pub fn wake_all(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    /// (sleeps, wakes) seen so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.sleeps.load(Ordering::Relaxed), self.wakes.load(Ordering::Relaxed))
    }
}
