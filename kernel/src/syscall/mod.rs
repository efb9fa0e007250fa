//! System call interface
//!
//! Errno constants, the memory-core syscall numbers, and a thin dispatch
//! layer over the running kernel's `MemorySystem` singleton. Commands
//! whose buffers need user-space marshalling (shmctl stat/info) are
//! reached through the typed methods; the arch layer owns the copies.

use spin::Mutex;

use crate::ipc::shm::ShmCtl;
use crate::memory::{MemoryConfig, MemorySystem};
use crate::process::Pid;

/// Error codes (Linux-compatible, negative values)
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const EINTR: i64 = -4;
    pub const ENOMEM: i64 = -12;
    pub const EACCES: i64 = -13;
    pub const EFAULT: i64 = -14;
    pub const EEXIST: i64 = -17;
    pub const EINVAL: i64 = -22;
    pub const ENOSPC: i64 = -28;
    pub const ENOSYS: i64 = -38;
    pub const EIDRM: i64 = -43;
}

/// Syscall numbers served by the memory core (x86_64 numbering)
pub mod nr {
    pub const MPROTECT: u64 = 10;
    pub const SHMGET: u64 = 29;
    pub const SHMAT: u64 = 30;
    pub const SHMCTL: u64 = 31;
    pub const SHMDT: u64 = 67;
}

lazy_static::lazy_static! {
    /// The running kernel's memory subsystem. Tests build their own
    /// instances instead; the singleton exists for the syscall path,
    /// where there is exactly one kernel.
    static ref KERNEL: Mutex<Option<MemorySystem>> = Mutex::new(None);
}

/// Bring up the global memory subsystem.
pub fn init(config: MemoryConfig) {
    let mut kernel = KERNEL.lock();
    if kernel.is_some() {
        log::warn!("[SYSCALL] memory subsystem already initialized");
        return;
    }
    *kernel = Some(MemorySystem::new(config));
    log::info!("[SYSCALL] memory syscalls ready");
}

/// Run `f` against the global subsystem. Locking the singleton is the
/// single-CPU interrupt-disable analogue.
pub fn with_kernel<R>(f: impl FnOnce(&mut MemorySystem) -> R) -> Option<R> {
    let mut kernel = KERNEL.lock();
    kernel.as_mut().map(f)
}

/// Dispatch one memory-core syscall for `pid`.
///
/// shmat reports the mapped address as a positive return value; shmctl
/// here serves only the bufferless commands (RMID, LOCK, UNLOCK).
pub fn handle(pid: Pid, num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let served = with_kernel(|ms| match num {
        nr::MPROTECT => ms.sys_mprotect(pid, a1, a2, a3 as u32),
        nr::SHMGET => ms.sys_shmget(pid, a1 as i32, a2 as usize, a3 as u32),
        nr::SHMAT => {
            let mut raddr = 0u64;
            let err = ms.sys_shmat(pid, a1 as i64, a2, a3 as u32, &mut raddr);
            if err == 0 {
                raddr as i64
            } else {
                err
            }
        }
        nr::SHMCTL => ms.sys_shmctl(pid, a1 as i64, a2 as u32, ShmCtl::None),
        nr::SHMDT => ms.sys_shmdt(pid, a1),
        _ => errno::ENOSYS,
    });
    served.unwrap_or(errno::ENOSYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscalls_are_enosys() {
        init(MemoryConfig::default());
        assert_eq!(handle(0, 9999, 0, 0, 0), errno::ENOSYS);
    }

    #[test]
    fn dispatch_reaches_the_shm_engine() {
        init(MemoryConfig::default());
        let pid = with_kernel(|ms| ms.create_task("sys").unwrap()).unwrap();
        let id = handle(pid, nr::SHMGET, 0, 0x3000, 0o600 | crate::ipc::IPC_CREAT as u64);
        assert!(id >= 0);
        let addr = handle(pid, nr::SHMAT, id as u64, 0, 0);
        assert!(addr > 0);
        assert_eq!(handle(pid, nr::SHMDT, addr as u64, 0, 0), 0);
        assert_eq!(handle(pid, nr::SHMCTL, id as u64, crate::ipc::shm::IPC_RMID as u64, 0), 0);
    }
}
