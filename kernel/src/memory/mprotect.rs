//! mprotect: protection changes over VMA ranges
//!
//! A change over part of an area splits it (head, tail, or middle into
//! three) with per-piece offsets fixed up so `start + offset` keeps
//! addressing the same backing byte, then rewrites the leaf entries over
//! the byte range and coalesces whatever became identical.

use super::paging::{self, PROTECTION_MAP};
use super::vma::{self, vm, VmaId};
use super::{KernelError, MemorySystem, PAGE_SIZE};
use crate::process::Pid;

// User-visible protection bits; they coincide with the VMA action bits.
pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = vm::VM_READ;
pub const PROT_WRITE: u32 = vm::VM_WRITE;
pub const PROT_EXEC: u32 = vm::VM_EXEC;

impl MemorySystem {
    /// Replace flags in place: the change covers the whole area.
    fn mprotect_fixup_all(&mut self, id: VmaId, newflags: u32, prot: u64) {
        let v = self.vmas.get_mut(id);
        v.flags = newflags;
        v.page_prot = prot;
    }

    /// Change covers [start, end) with start at the area boundary: the
    /// changed piece becomes a new record, the survivor keeps the tail.
    fn mprotect_fixup_start(
        &mut self,
        pid: Pid,
        id: VmaId,
        end: u64,
        newflags: u32,
        prot: u64,
    ) -> Result<(), KernelError> {
        let mut piece = self.vmas.get(id).clone();
        piece.end = end;
        piece.flags = newflags;
        piece.page_prot = prot;
        piece.share_next = None;
        piece.share_prev = None;
        {
            let v = self.vmas.get_mut(id);
            v.offset += end - v.start;
            v.start = end;
        }
        let piece_id = self.vmas.alloc(piece);
        self.vma_open(piece_id);
        let MemorySystem { vmas, files, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        vma::insert_vm_struct(vmas, files, task, piece_id);
        Ok(())
    }

    /// Symmetric tail case: the changed piece covers [start, vma.end).
    fn mprotect_fixup_end(
        &mut self,
        pid: Pid,
        id: VmaId,
        start: u64,
        newflags: u32,
        prot: u64,
    ) -> Result<(), KernelError> {
        let mut piece = self.vmas.get(id).clone();
        piece.offset += start - piece.start;
        piece.start = start;
        piece.flags = newflags;
        piece.page_prot = prot;
        piece.share_next = None;
        piece.share_prev = None;
        self.vmas.get_mut(id).end = start;
        let piece_id = self.vmas.alloc(piece);
        self.vma_open(piece_id);
        let MemorySystem { vmas, files, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        vma::insert_vm_struct(vmas, files, task, piece_id);
        Ok(())
    }

    /// Both endpoints interior: three pieces, the middle one changed.
    fn mprotect_fixup_middle(
        &mut self,
        pid: Pid,
        id: VmaId,
        start: u64,
        end: u64,
        newflags: u32,
        prot: u64,
    ) -> Result<(), KernelError> {
        let (mut left, mut right) = {
            let v = self.vmas.get(id);
            (v.clone(), v.clone())
        };
        left.end = start;
        left.share_next = None;
        left.share_prev = None;
        right.offset += end - right.start;
        right.start = end;
        right.share_next = None;
        right.share_prev = None;
        {
            let v = self.vmas.get_mut(id);
            v.offset += start - v.start;
            v.start = start;
            v.end = end;
            v.flags = newflags;
            v.page_prot = prot;
        }
        let left_id = self.vmas.alloc(left);
        let right_id = self.vmas.alloc(right);
        self.vma_open(left_id);
        self.vma_open(right_id);
        let MemorySystem { vmas, files, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        vma::insert_vm_struct(vmas, files, task, left_id);
        vma::insert_vm_struct(vmas, files, task, right_id);
        Ok(())
    }

    /// Apply `newflags` to the slice [start, end) of one area, then walk
    /// the leaf entries.
    fn mprotect_fixup(
        &mut self,
        pid: Pid,
        id: VmaId,
        start: u64,
        end: u64,
        newflags: u32,
    ) -> Result<(), KernelError> {
        let (v_start, v_end, v_flags) = {
            let v = self.vmas.get(id);
            (v.start, v.end, v.flags)
        };
        if newflags == v_flags {
            return Ok(());
        }
        let newprot = PROTECTION_MAP[(newflags & 0xf) as usize];
        if start == v_start {
            if end == v_end {
                self.mprotect_fixup_all(id, newflags, newprot);
            } else {
                self.mprotect_fixup_start(pid, id, end, newflags, newprot)?;
            }
        } else if end == v_end {
            self.mprotect_fixup_end(pid, id, start, newflags, newprot)?;
        } else {
            self.mprotect_fixup_middle(pid, id, start, end, newflags, newprot)?;
        }
        let MemorySystem { phys, tlb, tasks, .. } = self;
        let task = tasks.get(pid).ok_or(KernelError::InvalidArg)?;
        paging::change_protection(phys, tlb, task, start, end, newprot);
        Ok(())
    }

    /// mprotect(2): change the access bits over [start, start+len).
    pub fn sys_mprotect(&mut self, pid: Pid, start: u64, len: u64, prot: u32) -> i64 {
        use crate::syscall::errno::*;

        if start & (PAGE_SIZE as u64 - 1) != 0 {
            return EINVAL;
        }
        let len = (len + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let end = start + len;
        if end < start {
            return EINVAL;
        }
        if prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
            return EINVAL;
        }
        if end == start {
            return 0;
        }
        let Some(task) = self.tasks.get(pid) else {
            return EINVAL;
        };
        let mut vma_id = match vma::find_vma(&self.vmas, task, start) {
            Some(id) if self.vmas.get(id).start <= start => id,
            _ => return EFAULT,
        };

        let mut error: i64 = 0;
        let mut nstart = start;
        loop {
            let (v_end, v_flags) = {
                let v = self.vmas.get(vma_id);
                (v.end, v.flags)
            };
            // vma.start <= nstart < vma.end holds here
            let newflags = prot | (v_flags & !(PROT_READ | PROT_WRITE | PROT_EXEC));
            // every requested action bit needs its MAY counterpart
            if (newflags & !(newflags >> 4)) & 0xf != 0 {
                error = EACCES;
                break;
            }
            if v_end >= end {
                if let Err(e) = self.mprotect_fixup(pid, vma_id, nstart, end, newflags) {
                    error = e.errno();
                }
                break;
            }
            if let Err(e) = self.mprotect_fixup(pid, vma_id, nstart, v_end, newflags) {
                error = e.errno();
                break;
            }
            nstart = v_end;
            let task = self.tasks.get(pid).unwrap();
            match vma::find_vma(&self.vmas, task, nstart) {
                Some(next) if self.vmas.get(next).start == nstart => vma_id = next,
                _ => {
                    error = EFAULT;
                    break;
                }
            }
        }
        let MemorySystem { vmas, files, tasks, .. } = self;
        if let Some(task) = tasks.get_mut(pid) {
            vma::merge_segments(vmas, files, task, start, end);
        }
        error
    }
}
