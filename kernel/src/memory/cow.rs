//! Copy-on-write fork support
//!
//! Address-space duplication in three flavors: drop user mappings only
//! (exec), drop everything (exit), share the whole directory (thread-like
//! clone), or deep-copy with COW (fork). Plus the write-protect fault that
//! resolves the deferred copies.

use alloc::vec::Vec;

use super::frame::{gfp, FrameAllocator, FrameNo};
use super::paging::{
    self, free_one_pgd, mk_table_entry, FlushBatch, Pte, PteRef, ENTRIES_PER_TABLE, PGDIR_SHIFT,
    PMD_SHIFT,
};
use super::swap::{free_page_and_swap_cache, SwapManager};
use super::vma::vm;
use super::{KernelError, MemorySystem, PAGE_SHIFT, USER_PTRS_PER_PGD};
use crate::process::{send_sig, Pid, PID_BOOT, SIGKILL};

/// (start, end, shared) snapshot of the parent's mappings, consulted for
/// the COW decision while walking leaf tables.
type ShareMap = Vec<(u64, u64, bool)>;

fn range_shared(ranges: &ShareMap, addr: u64) -> bool {
    ranges
        .iter()
        .find(|&&(s, e, _)| addr >= s && addr < e)
        .map(|&(_, _, shared)| shared)
        .unwrap_or(false)
}

/// Unhook a frame from the swap cache entirely (slot ref and frame ref).
fn remove_from_swap_cache(phys: &mut FrameAllocator, swap: &mut SwapManager, frame: FrameNo) -> bool {
    if swap.delete_from_swap_cache(frame) {
        phys.free(frame, 0);
        true
    } else {
        false
    }
}

/// Duplicate one leaf entry with the COW rules:
/// swapped entries gain a device reference; reserved or out-of-range
/// frames copy verbatim; anything else write-protects both sides when the
/// mapping is private and writable, leaves the swap cache, and bumps the
/// frame count. Returns 1 if the child gained a resident page.
fn copy_one_pte(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    ranges: &ShareMap,
    addr: u64,
    src: PteRef,
    dst: PteRef,
) -> usize {
    let pte = src.get(phys);
    if pte.none() {
        return 0;
    }
    if !pte.present() {
        swap.swap_duplicate(pte.raw());
        dst.set(phys, pte);
        return 0;
    }
    let frame = pte.page();
    if phys.out_of_range(frame) || phys.is_reserved(frame) {
        dst.set(phys, pte);
        return 0;
    }
    let shared = range_shared(ranges, addr);
    let mut pte = pte;
    if !shared && pte.write() {
        pte = pte.wrprotect();
    }
    if !shared && remove_from_swap_cache(phys, swap, frame) {
        // The child will own dirtiness once the cache copy is gone.
        pte = pte.mkdirty();
    }
    dst.set(phys, pte.mkold());
    src.set(phys, pte);
    phys.inc_ref(frame);
    1
}

fn copy_one_pmd(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    ranges: &ShareMap,
    base: u64,
    src: PteRef,
    dst: PteRef,
) -> Result<usize, KernelError> {
    let entry = src.get(phys);
    if entry.none() {
        return Ok(0);
    }
    if !entry.present() || phys.out_of_range(entry.page()) {
        log::error!("[COW] bad page table at {:#x}: probable memory corruption", entry.raw());
        src.clear(phys);
        return Ok(0);
    }
    let table = entry.page();
    if phys.is_reserved(table) {
        dst.set(phys, entry);
        return Ok(0);
    }
    if phys.ref_count(table) > 1 {
        // Shared leaf table: share it onward.
        phys.inc_ref(table);
        dst.set(phys, entry);
        return Ok(0);
    }
    let new_table = phys.alloc(0, gfp::GFP_KERNEL).ok_or(KernelError::NoMemory)?;
    phys.zero_page(new_table);
    dst.set(phys, mk_table_entry(new_table));
    let mut rss = 0;
    for j in 0..ENTRIES_PER_TABLE {
        rss += copy_one_pte(
            phys,
            swap,
            ranges,
            base + ((j as u64) << PAGE_SHIFT),
            PteRef { table, index: j },
            PteRef { table: new_table, index: j },
        );
    }
    Ok(rss)
}

fn copy_one_pgd(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    ranges: &ShareMap,
    base: u64,
    src: PteRef,
    dst: PteRef,
) -> Result<usize, KernelError> {
    let entry = src.get(phys);
    if entry.none() {
        return Ok(0);
    }
    if !entry.present() || phys.out_of_range(entry.page()) {
        log::error!("[COW] bad directory entry {:#x}: probable memory corruption", entry.raw());
        src.clear(phys);
        return Ok(0);
    }
    let table = entry.page();
    if phys.is_reserved(table) {
        // Kernel-shared middle table: always shared by all processes.
        dst.set(phys, entry);
        return Ok(0);
    }
    if phys.ref_count(table) > 1 {
        phys.inc_ref(table);
        dst.set(phys, entry);
        return Ok(0);
    }
    let new_table = phys.alloc(0, gfp::GFP_KERNEL).ok_or(KernelError::NoMemory)?;
    phys.zero_page(new_table);
    dst.set(phys, mk_table_entry(new_table));
    let mut rss = 0;
    for j in 0..ENTRIES_PER_TABLE {
        rss += copy_one_pmd(
            phys,
            swap,
            ranges,
            base + ((j as u64) << PMD_SHIFT),
            PteRef { table, index: j },
            PteRef { table: new_table, index: j },
        )?;
    }
    Ok(rss)
}

impl MemorySystem {
    /// Drop user-space mappings only, keeping the kernel ones: exec needs
    /// the old pages out of the way but a live table tree. A directory
    /// shared with another task is replaced by a private one instead of
    /// being emptied under it.
    pub fn clear_page_tables(&mut self, pid: Pid) {
        if pid == PID_BOOT {
            panic!("task[0] (swapper) doesn't support exec");
        }
        let Some(task) = self.tasks.get(pid) else { return };
        let root = task.root;
        if root == self.boot_root {
            log::error!("[COW] pid {} trying to clear the boot page directory", pid);
            return;
        }
        if self.phys.ref_count(root) > 1 {
            let Some(new_root) = self.phys.alloc(0, gfp::GFP_KERNEL) else {
                self.oom(pid);
                return;
            };
            self.phys.zero_page(new_root);
            for i in USER_PTRS_PER_PGD..ENTRIES_PER_TABLE {
                let entry = self.phys.read_word(root, i);
                self.phys.write_word(new_root, i, entry);
            }
            self.tasks.get_mut(pid).unwrap().root = new_root;
            self.phys.free(root, 0);
        } else {
            let MemorySystem { phys, swap, .. } = self;
            for i in 0..USER_PTRS_PER_PGD {
                free_one_pgd(phys, swap, PteRef { table: root, index: i });
            }
        }
        let mut flush = FlushBatch::new();
        flush.all(pid);
        flush.commit(&mut self.tlb);
    }

    /// Drop all mappings including kernel slots (exit). The task is parked
    /// on the boot directory first.
    pub fn free_page_tables(&mut self, pid: Pid) {
        if pid == PID_BOOT {
            panic!("trying to free up swapper memory space");
        }
        let Some(task) = self.tasks.get(pid) else { return };
        let root = task.root;
        if root == self.boot_root {
            log::error!("[COW] pid {} trying to free the boot page directory", pid);
            return;
        }
        self.tasks.get_mut(pid).unwrap().root = self.boot_root;
        self.phys.inc_ref(self.boot_root);
        if self.phys.ref_count(root) > 1 {
            self.phys.free(root, 0);
        } else {
            let MemorySystem { phys, swap, .. } = self;
            for i in 0..ENTRIES_PER_TABLE {
                free_one_pgd(phys, swap, PteRef { table: root, index: i });
            }
            phys.free(root, 0);
        }
        let mut flush = FlushBatch::new();
        flush.all(pid);
        flush.commit(&mut self.tlb);
    }

    /// Share `src`'s whole directory with `dst` (thread-like clone): both
    /// tasks see exactly the same pages from now on.
    pub fn clone_page_tables(&mut self, src: Pid, dst: Pid) -> Result<(), KernelError> {
        let src_root = self.tasks.get(src).ok_or(KernelError::InvalidArg)?.root;
        let dst_task = self.tasks.get_mut(dst).ok_or(KernelError::InvalidArg)?;
        let old = dst_task.root;
        dst_task.root = src_root;
        self.phys.inc_ref(src_root);
        if old != src_root && old != self.boot_root {
            self.phys.free(old, 0);
        }
        Ok(())
    }

    /// Deep-copy `src`'s tables into `dst` with COW semantics. Interior
    /// tables that are already shared stay shared; private writable leaves
    /// are write-protected on both sides.
    pub fn copy_page_tables(&mut self, src: Pid, dst: Pid) -> Result<(), KernelError> {
        let src_root = self.tasks.get(src).ok_or(KernelError::InvalidArg)?.root;
        let dst_root = self.tasks.get(dst).ok_or(KernelError::InvalidArg)?.root;
        let ranges: ShareMap = self
            .tasks
            .get(src)
            .unwrap()
            .vmas
            .iter()
            .map(|&id| {
                let v = self.vmas.get(id);
                (v.start, v.end, v.flags & vm::VM_SHARED != 0)
            })
            .collect();

        let mut rss = 0;
        let result = (|| {
            let MemorySystem { phys, swap, .. } = self;
            for i in 0..ENTRIES_PER_TABLE {
                rss += copy_one_pgd(
                    phys,
                    swap,
                    &ranges,
                    (i as u64) << PGDIR_SHIFT,
                    PteRef { table: src_root, index: i },
                    PteRef { table: dst_root, index: i },
                )?;
            }
            Ok(())
        })();

        self.tasks.get_mut(dst).unwrap().rss = rss;
        let mut flush = FlushBatch::new();
        flush.all(src);
        flush.commit(&mut self.tlb);
        result
    }

    /// The BAD_PAGE sentinel: a PTE naming the reserved landing frame.
    /// Installed when a fault cannot allocate; any access re-faults and
    /// the process dies by signal.
    pub fn bad_page(&self) -> Pte {
        Pte::mk_pte(self.bad_frame, paging::prot::PAGE_SHARED)
    }

    /// Write-protect fault: a present, non-writable page was written. Sole
    /// owners get the write bit back; shared frames are copied and the old
    /// frame loses a reference. On allocation failure the sentinel goes in
    /// and the task is killed.
    pub fn do_wp_page(&mut self, vma_id: super::vma::VmaId, address: u64) {
        let (pid, page_prot) = {
            let v = self.vmas.get(vma_id);
            (v.task, v.page_prot)
        };
        let new_page = self.get_free_page(gfp::GFP_KERNEL);
        let root = match self.tasks.get(pid) {
            Some(t) => t.root,
            None => return,
        };
        let release_unused = |ms: &mut MemorySystem| {
            if let Some(f) = new_page {
                ms.phys.free(f, 0);
            }
        };

        let Some(slot) = paging::walk(&self.phys, root, address) else {
            release_unused(self);
            return;
        };
        let pte = slot.get(&self.phys);
        if !pte.present() || pte.write() {
            release_unused(self);
            return;
        }
        let old_page = pte.page();
        if self.phys.out_of_range(old_page) {
            log::error!("[COW] bogus page at address {:#x} ({:#x})", address, pte.raw());
            if let Some(task) = self.tasks.get_mut(pid) {
                send_sig(SIGKILL, task);
            }
            release_unused(self);
            return;
        }
        self.tasks.get_mut(pid).unwrap().min_flt += 1;

        let mut flush = FlushBatch::new();
        if self.phys.ref_count(old_page) != 1 {
            match new_page {
                Some(new) => {
                    if self.phys.is_reserved(old_page) {
                        self.tasks.get_mut(pid).unwrap().rss += 1;
                    }
                    self.phys.copy_page(old_page, new);
                    slot.set(&mut self.phys, Pte::mk_pte(new, page_prot).mkdirty().mkwrite());
                    free_page_and_swap_cache(&mut self.phys, &mut self.swap, old_page);
                }
                None => {
                    let bad = self.bad_page();
                    slot.set(&mut self.phys, bad);
                    free_page_and_swap_cache(&mut self.phys, &mut self.swap, old_page);
                    self.oom(pid);
                }
            }
            flush.page(pid, address);
            flush.commit(&mut self.tlb);
            return;
        }
        // Sole owner: restore write permission in place.
        slot.set(&mut self.phys, pte.mkdirty().mkwrite());
        flush.page(pid, address);
        flush.commit(&mut self.tlb);
        release_unused(self);
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemorySystem;
    use super::*;

    #[test]
    fn clone_shares_the_root() {
        let mut ms = MemorySystem::new_default();
        let a = ms.create_task("a").unwrap();
        let b = ms.create_task("b").unwrap();
        let a_root = ms.tasks.get(a).unwrap().root;
        ms.clone_page_tables(a, b).unwrap();
        assert_eq!(ms.tasks.get(b).unwrap().root, a_root);
        assert_eq!(ms.phys.ref_count(a_root), 2);
    }

    #[test]
    fn clear_on_shared_root_splits_it() {
        let mut ms = MemorySystem::new_default();
        let a = ms.create_task("a").unwrap();
        let b = ms.create_task("b").unwrap();
        ms.clone_page_tables(a, b).unwrap();
        let shared = ms.tasks.get(a).unwrap().root;
        ms.clear_page_tables(b);
        let b_root = ms.tasks.get(b).unwrap().root;
        assert_ne!(b_root, shared);
        assert_eq!(ms.phys.ref_count(shared), 1);
        // New root kept the kernel slots.
        assert!(paging::follow(&ms.phys, b_root, paging::TASK_SIZE).is_some());
    }

    #[test]
    #[should_panic]
    fn freeing_the_boot_task_panics() {
        let mut ms = MemorySystem::new_default();
        ms.free_page_tables(PID_BOOT);
    }

    fn anon_rw(ms: &mut MemorySystem, pid: crate::process::Pid, start: u64, pages: u64) {
        use super::super::vma::{Vma, VmaBacking};
        let id = ms.vmas.alloc(Vma {
            start,
            end: start + pages * super::super::PAGE_SIZE as u64,
            flags: vm::VM_READ | vm::VM_WRITE | vm::VM_MAYREAD | vm::VM_MAYWRITE,
            page_prot: paging::PROTECTION_MAP[0b0011],
            offset: 0,
            backing: VmaBacking::Anonymous,
            task: pid,
            share_next: None,
            share_prev: None,
        });
        let MemorySystem { vmas, files, tasks, .. } = ms;
        super::super::vma::insert_vm_struct(vmas, files, tasks.get_mut(pid).unwrap(), id);
    }

    #[test]
    fn fork_write_protects_both_sides() {
        let mut ms = MemorySystem::new_default();
        let parent = ms.create_task("parent").unwrap();
        let addr = 0x40_0000u64;
        anon_rw(&mut ms, parent, addr, 2);
        ms.write_user(parent, addr, b"before fork").unwrap();

        let child = ms.fork_task(parent, "child", false).unwrap();
        let p_root = ms.tasks.get(parent).unwrap().root;
        let c_root = ms.tasks.get(child).unwrap().root;
        let p_pte = paging::walk(&ms.phys, p_root, addr).unwrap().get(&ms.phys);
        let c_pte = paging::walk(&ms.phys, c_root, addr).unwrap().get(&ms.phys);
        assert_eq!(p_pte.page(), c_pte.page());
        assert!(!p_pte.write() && !c_pte.write());
        assert!(!c_pte.young());
        assert_eq!(ms.phys.ref_count(p_pte.page()), 2);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn cow_fault_gives_each_side_its_own_frame() {
        let mut ms = MemorySystem::new_default();
        let parent = ms.create_task("parent").unwrap();
        let addr = 0x40_0000u64;
        anon_rw(&mut ms, parent, addr, 2);
        ms.write_user(parent, addr, b"parent data here").unwrap();
        let child = ms.fork_task(parent, "child", false).unwrap();

        ms.tlb.clear();
        // Child write: shared frame splits, parent contents survive.
        ms.write_user(child, addr, b"child scribbles!").unwrap();

        let p_root = ms.tasks.get(parent).unwrap().root;
        let c_root = ms.tasks.get(child).unwrap().root;
        let p_pte = paging::walk(&ms.phys, p_root, addr).unwrap().get(&ms.phys);
        let c_pte = paging::walk(&ms.phys, c_root, addr).unwrap().get(&ms.phys);
        assert_ne!(p_pte.page(), c_pte.page());
        assert_eq!(ms.phys.ref_count(p_pte.page()), 1);
        assert_eq!(ms.phys.ref_count(c_pte.page()), 1);
        assert!(c_pte.write() && c_pte.dirty());

        // Only the child's TLB saw an invalidation for the fault.
        assert!(ms.tlb.flushes_for(child) > 0);
        assert_eq!(ms.tlb.flushes_for(parent), 0);

        let mut buf = [0u8; 16];
        ms.read_user(parent, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"parent data here");
        ms.read_user(child, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"child scribbles!");

        // Parent's next write is the sole-owner fast path.
        ms.write_user(parent, addr, b"parent again....").unwrap();
        let p_pte = paging::walk(&ms.phys, p_root, addr).unwrap().get(&ms.phys);
        assert!(p_pte.write() && p_pte.dirty());
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn exit_returns_every_frame() {
        let mut ms = MemorySystem::new_default();
        let free0 = ms.phys.nr_free();
        let pid = ms.create_task("mortal").unwrap();
        let addr = 0x40_0000u64;
        anon_rw(&mut ms, pid, addr, 4);
        for i in 0..4u64 {
            ms.write_user(pid, addr + i * super::super::PAGE_SIZE as u64, b"x").unwrap();
        }
        ms.exit_mm(pid);
        assert_eq!(ms.phys.nr_free(), free0);
        assert_eq!(ms.phys.verify_free_lists(), 0);
    }

    #[test]
    fn fork_then_exit_child_keeps_parent_intact() {
        let mut ms = MemorySystem::new_default();
        let parent = ms.create_task("parent").unwrap();
        let addr = 0x40_0000u64;
        anon_rw(&mut ms, parent, addr, 2);
        ms.write_user(parent, addr, b"survives the child").unwrap();
        let child = ms.fork_task(parent, "child", false).unwrap();
        ms.exit_mm(child);
        let mut buf = [0u8; 18];
        ms.read_user(parent, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"survives the child");
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }
}
