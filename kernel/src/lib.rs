//! RivetOS kernel core: memory management.
//!
//! The crate carries the three engines every other subsystem leans on:
//! the page frame allocator with its pooled small-object allocator on top,
//! the per-process address-space engine (three-level page tables, COW fork,
//! demand paging), and System-V shared memory segments. Physical memory is
//! owned by the [`memory::MemorySystem`] handle, so the whole core also runs
//! hosted for tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logger;
pub mod sched;
pub mod process;
pub mod usercopy;
pub mod memory;
pub mod ipc;
pub mod syscall;

pub use memory::{KernelError, MemoryConfig, MemorySystem};
pub use process::Pid;
