//! Checked user-memory access
//!
//! Validation walks the VMA list (with grows-down stack extension), the
//! copies themselves walk the page tables and take the ordinary fault
//! path for anything not yet resident or not yet writable. This is the
//! same road a hardware access would travel, so demand paging, COW and
//! swap-in all trigger exactly as they would under the MMU.

use crate::memory::vma::{self, vm};
use crate::memory::{paging, KernelError, MemorySystem, PAGE_SIZE};
use crate::process::Pid;

/// Largest distance a grows-down area may be extended by a single access
const STACK_LIMIT: u64 = 8 * 1024 * 1024;

/// Requested access kind for `verify_area`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
}

impl MemorySystem {
    /// Check that [addr, addr+size) lies inside VMAs permitting the
    /// access, crossing into contiguous neighbors as needed.
    pub fn verify_area(&self, pid: Pid, ty: AccessType, addr: u64, size: u64) -> Result<(), KernelError> {
        let task = self.tasks.get(pid).ok_or(KernelError::InvalidArg)?;
        let mut id = vma::find_vma(&self.vmas, task, addr).ok_or(KernelError::BadAddress)?;
        {
            let v = self.vmas.get(id);
            if v.start > addr {
                if v.flags & vm::VM_GROWSDOWN == 0 {
                    return Err(KernelError::BadAddress);
                }
                if v.end - addr > STACK_LIMIT {
                    return Err(KernelError::BadAddress);
                }
            }
        }
        let need = match ty {
            AccessType::Read => vm::VM_READ,
            AccessType::Write => vm::VM_WRITE,
        };
        let mut start = addr;
        loop {
            let v = self.vmas.get(id);
            if v.flags & need == 0 {
                return Err(KernelError::BadAddress);
            }
            if v.end - start >= size {
                return Ok(());
            }
            let task = self.tasks.get(pid).unwrap();
            let next = vma::find_vma(&self.vmas, task, v.end).ok_or(KernelError::BadAddress)?;
            if self.vmas.get(next).start != v.end {
                return Err(KernelError::BadAddress);
            }
            start = v.end;
            id = next;
        }
    }

    /// Copy bytes out of a task's address space, faulting pages in as
    /// needed.
    pub fn read_user(&mut self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        self.verify_area(pid, AccessType::Read, addr, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let frame_off = self.user_page(pid, cur, false)?;
            let (frame, off) = frame_off;
            let chunk = (PAGE_SIZE - off).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(&self.phys.page(frame)[off..off + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes into a task's address space, faulting and COW-breaking
    /// as needed.
    pub fn write_user(&mut self, pid: Pid, addr: u64, buf: &[u8]) -> Result<(), KernelError> {
        self.verify_area(pid, AccessType::Write, addr, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr + done as u64;
            let (frame, off) = self.user_page(pid, cur, true)?;
            let chunk = (PAGE_SIZE - off).min(buf.len() - done);
            self.phys.page_mut(frame)[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Resolve one user page the way the MMU would: walk, fault on
    /// absence or a write to a read-only entry, re-walk. A private file
    /// write takes two faults (install read-only, then break the copy),
    /// so a couple of retries are legitimate.
    fn user_page(&mut self, pid: Pid, addr: u64, write: bool) -> Result<(usize, usize), KernelError> {
        for _ in 0..4 {
            let root = self.tasks.get(pid).ok_or(KernelError::InvalidArg)?.root;
            if let Some(slot) = paging::walk(&self.phys, root, addr) {
                let pte = slot.get(&self.phys);
                if pte.present() && (!write || pte.write()) {
                    if pte.page() == self.bad_frame {
                        return Err(KernelError::NoMemory);
                    }
                    return Ok((pte.page(), (addr & (PAGE_SIZE as u64 - 1)) as usize));
                }
            }
            self.handle_mm_fault(pid, addr, write)?;
            if let Some(task) = self.tasks.get(pid) {
                if task.pending_signal.is_some() {
                    return Err(KernelError::NoMemory);
                }
            }
        }
        Err(KernelError::BadAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vma::{Vma, VmaBacking};
    use crate::memory::paging::PROTECTION_MAP;

    fn anon_vma(ms: &mut MemorySystem, pid: Pid, start: u64, pages: u64, flags: u32) {
        let id = ms.vmas.alloc(Vma {
            start,
            end: start + pages * PAGE_SIZE as u64,
            flags,
            page_prot: PROTECTION_MAP[(flags & 0xf) as usize],
            offset: 0,
            backing: VmaBacking::Anonymous,
            task: pid,
            share_next: None,
            share_prev: None,
        });
        let MemorySystem { vmas, files, tasks, .. } = ms;
        vma::insert_vm_struct(vmas, files, tasks.get_mut(pid).unwrap(), id);
    }

    const RW: u32 = vm::VM_READ | vm::VM_WRITE | vm::VM_MAYREAD | vm::VM_MAYWRITE;

    #[test]
    fn write_then_read_round_trips_through_demand_paging() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("u").unwrap();
        anon_vma(&mut ms, pid, 0x40_0000, 4, RW);
        let msg = b"paged in on demand";
        ms.write_user(pid, 0x40_0123, msg).unwrap();
        let mut back = [0u8; 18];
        ms.read_user(pid, 0x40_0123, &mut back).unwrap();
        assert_eq!(&back, msg);
        assert_eq!(ms.tasks.get(pid).unwrap().rss, 1);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn access_outside_any_vma_is_refused() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("u").unwrap();
        anon_vma(&mut ms, pid, 0x40_0000, 1, RW);
        let mut buf = [0u8; 4];
        assert_eq!(ms.read_user(pid, 0x90_0000, &mut buf), Err(KernelError::BadAddress));
        // crossing out of the mapping's end also fails
        assert_eq!(
            ms.read_user(pid, 0x40_0000 + PAGE_SIZE as u64 - 2, &mut buf),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn write_to_readonly_mapping_is_refused() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("u").unwrap();
        anon_vma(&mut ms, pid, 0x40_0000, 1, vm::VM_READ | vm::VM_MAYREAD);
        assert_eq!(ms.write_user(pid, 0x40_0000, b"x"), Err(KernelError::BadAddress));
    }

    #[test]
    fn growsdown_area_extends_under_the_access() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("u").unwrap();
        let stack_top = 0x80_0000;
        anon_vma(&mut ms, pid, stack_top, 2, RW | vm::VM_GROWSDOWN);
        // touch below the current start: the area grows to cover it
        ms.write_user(pid, stack_top - 8, b"retaddr!").unwrap();
        let task = ms.tasks.get(pid).unwrap();
        let v = ms.vmas.get(task.vmas[0]);
        assert!(v.start <= stack_top - 8);
    }

    #[test]
    fn reads_cross_contiguous_vmas() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("u").unwrap();
        anon_vma(&mut ms, pid, 0x40_0000, 1, RW);
        anon_vma(&mut ms, pid, 0x40_0000 + PAGE_SIZE as u64, 1, vm::VM_READ | vm::VM_MAYREAD);
        let mut buf = [0u8; 64];
        ms.read_user(pid, 0x40_0000 + PAGE_SIZE as u64 - 32, &mut buf).unwrap();
    }
}
