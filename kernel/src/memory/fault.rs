//! Fault handling
//!
//! Entry from the architecture trap with (address, write-access). The leaf
//! entry decides the path: all-zero means no-page (zero fill, backing-file
//! read, or sharing with another mapper), a non-present non-zero value
//! means swap-in (generic or the segment engine's), present-but-readonly
//! on a write is the COW fault in `cow`.

use super::frame::{gfp, FrameNo};
use super::paging::{self, FlushBatch, Pte, PteRef};
use super::vma::{self, vm, VmaBacking, VmaId};
use super::{KernelError, MemorySystem, PAGE_SIZE};
use crate::process::Pid;

impl MemorySystem {
    /// Resolve a user fault at `address`. Returns BadAddress when no VMA
    /// covers it (after grows-down stack extension) or the access kind is
    /// not permitted.
    pub fn handle_mm_fault(&mut self, pid: Pid, address: u64, write_access: bool) -> Result<(), KernelError> {
        let task = self.tasks.get(pid).ok_or(KernelError::InvalidArg)?;
        let vma_id = vma::find_vma(&self.vmas, task, address).ok_or(KernelError::BadAddress)?;
        {
            let grow = {
                let v = self.vmas.get(vma_id);
                if v.start > address {
                    if v.flags & vm::VM_GROWSDOWN == 0 {
                        return Err(KernelError::BadAddress);
                    }
                    Some(address & !(PAGE_SIZE as u64 - 1))
                } else {
                    None
                }
            };
            if let Some(new_start) = grow {
                self.vmas.get_mut(vma_id).start = new_start;
            }
        }
        {
            let v = self.vmas.get(vma_id);
            if write_access && v.flags & vm::VM_WRITE == 0 {
                return Err(KernelError::BadAddress);
            }
            if !write_access && v.flags & vm::VM_READ == 0 {
                return Err(KernelError::BadAddress);
            }
        }

        let root = self.tasks.get(pid).unwrap().root;
        let pmd = match paging::pmd_alloc(&mut self.phys, root, address) {
            Ok(t) => t,
            Err(KernelError::NoMemory) => {
                self.oom(pid);
                return Err(KernelError::NoMemory);
            }
            Err(e) => return Err(e),
        };
        let leaf = match paging::pte_alloc(&mut self.phys, pmd, address) {
            Ok(t) => t,
            Err(KernelError::NoMemory) => {
                self.oom(pid);
                return Err(KernelError::NoMemory);
            }
            Err(e) => return Err(e),
        };
        let slot = PteRef { table: leaf, index: paging::pte_index(address) };

        let pte = slot.get(&self.phys);
        if !pte.present() {
            self.do_no_page(vma_id, address, write_access, slot);
            return Ok(());
        }
        // Hardware would set these; the young bit feeds replacement.
        slot.set(&mut self.phys, pte.mkyoung());
        if !write_access {
            return Ok(());
        }
        if pte.write() {
            slot.set(&mut self.phys, pte.mkyoung().mkdirty());
            return Ok(());
        }
        self.do_wp_page(vma_id, address);
        Ok(())
    }

    /// No-page fault: the leaf entry is empty (or names a swapped page,
    /// which detours to the swap path).
    fn do_no_page(&mut self, vma_id: VmaId, address: u64, write_access: bool, slot: PteRef) {
        let entry = slot.get(&self.phys);
        if entry.present() {
            return;
        }
        if !entry.none() {
            self.do_swap_page(vma_id, address, slot, entry, write_access);
            return;
        }
        let address = address & !(PAGE_SIZE as u64 - 1);
        let (pid, backing, page_prot, shared) = {
            let v = self.vmas.get(vma_id);
            (v.task, v.backing.clone(), v.page_prot, v.shared())
        };

        match backing {
            VmaBacking::Anonymous | VmaBacking::SharedSeg { .. } => {
                // No nopage op: hand out a zero-filled page, writable.
                // (Segment signatures never reach here; their entries are
                // non-zero from attach time.)
                if let Some(task) = self.tasks.get_mut(pid) {
                    task.rss += 1;
                    task.min_flt += 1;
                }
                match self.get_free_page(gfp::GFP_KERNEL) {
                    Some(page) => {
                        self.put_page(slot, Pte::mk_pte(page, page_prot).mkwrite());
                    }
                    None => {
                        self.oom(pid);
                        let bad = self.bad_page();
                        self.put_page(slot, bad);
                    }
                }
            }
            VmaBacking::File { file } => {
                let candidate = self.get_free_page(gfp::GFP_KERNEL);
                if self.share_page(vma_id, address, write_access, candidate) {
                    if let Some(task) = self.tasks.get_mut(pid) {
                        task.min_flt += 1;
                        task.rss += 1;
                    }
                    return;
                }
                let Some(candidate) = candidate else {
                    self.oom(pid);
                    let bad = self.bad_page();
                    self.put_page(slot, bad);
                    return;
                };
                if let Some(task) = self.tasks.get_mut(pid) {
                    task.maj_flt += 1;
                    task.rss += 1;
                }
                let page = self.file_nopage(vma_id, file, address, candidate);
                // A mapper may have faulted the same file page in while the
                // read suspended us; share its frame and drop ours.
                if self.share_page(vma_id, address, write_access, None) {
                    self.free_page(page);
                    return;
                }
                // Early dirty marking: a writable install is either an
                // exclusive copy or a shared mapping, so the bits are safe
                // to set now and spare a wp fault later.
                let mut pte = Pte::mk_pte(page, page_prot);
                if write_access {
                    pte = pte.mkwrite().mkdirty();
                } else if self.phys.ref_count(page) > 1 && !shared {
                    pte = pte.wrprotect();
                }
                self.put_page(slot, pte);
            }
        }
    }

    /// Sanity-checked PTE install: the slot must still be empty.
    fn put_page(&mut self, slot: PteRef, pte: Pte) {
        let cur = slot.get(&self.phys);
        if !cur.none() {
            log::error!("[FAULT] put_page: page already exists {:#x}", cur.raw());
            self.free_page(pte.page());
            return;
        }
        slot.set(&mut self.phys, pte);
    }

    /// Backing-file read for the no-page fault: fill `frame` from the file
    /// at the VMA's offset. Returns the frame that now holds the page.
    fn file_nopage(&mut self, vma_id: VmaId, file: vma::FileId, address: u64, frame: FrameNo) -> FrameNo {
        let offset = {
            let v = self.vmas.get(vma_id);
            (address - v.start + v.offset) as usize
        };
        let data = &self.files.get(file).data;
        let end = data.len().min(offset + PAGE_SIZE);
        let chunk: alloc::vec::Vec<u8> = if offset < end { data[offset..end].to_vec() } else { alloc::vec::Vec::new() };
        let page = self.phys.page_mut(frame);
        page.fill(0);
        page[..chunk.len()].copy_from_slice(&chunk);
        frame
    }

    /// Look for another mapper of the same backing file already holding
    /// the wanted page, and either install its frame directly or copy it
    /// into `newpage` when the caller needs an exclusive writable copy.
    /// Consumes `newpage` on success.
    fn share_page(&mut self, area_id: VmaId, address: u64, write_access: bool, newpage: Option<FrameNo>) -> bool {
        let (file, area_offset, area_start, area_shared, first) = {
            let v = self.vmas.get(area_id);
            let file = match v.backing {
                VmaBacking::File { file } => file,
                _ => return false,
            };
            (file, v.offset, v.start, v.shared(), v.share_next)
        };
        if self.files.get(file).count < 2 {
            return false;
        }
        let give_page = if write_access && !area_shared {
            match newpage {
                Some(np) => Some(np),
                None => return false,
            }
        } else {
            None
        };
        let offset = address - area_start + area_offset;

        let mut cursor = first;
        while let Some(mpnt) = cursor {
            if mpnt == area_id {
                break;
            }
            let (m_file, m_start, m_end, m_offset, next) = {
                let v = self.vmas.get(mpnt);
                let f = match v.backing {
                    VmaBacking::File { file } => file,
                    _ => {
                        log::error!("[FAULT] corrupt file mapping ring");
                        return false;
                    }
                };
                (f, v.start, v.end, v.offset, v.share_next)
            };
            cursor = next;
            if m_file != file {
                log::error!("[FAULT] corrupt file mapping ring");
                break;
            }
            // offsets must be mutually page-aligned
            if (m_offset ^ area_offset) & (PAGE_SIZE as u64 - 1) != 0 {
                continue;
            }
            let from_address = offset + m_start - m_offset;
            if from_address < m_start || from_address >= m_end {
                continue;
            }
            if !self.try_to_share(address, area_id, from_address, mpnt, give_page) {
                continue;
            }
            // free newpage if we never used it
            if give_page.is_none() {
                if let Some(np) = newpage {
                    self.phys.free(np, 0);
                }
            }
            return true;
        }
        false
    }

    /// Check the page at `from_address` in the peer mapping and, if clean
    /// and shareable, wire it into the caller (or copy it into
    /// `give_page`).
    fn try_to_share(
        &mut self,
        to_address: u64,
        to_area: VmaId,
        from_address: u64,
        from_area: VmaId,
        give_page: Option<FrameNo>,
    ) -> bool {
        let (from_pid, from_shared) = {
            let v = self.vmas.get(from_area);
            (v.task, v.shared())
        };
        let (to_pid, to_prot) = {
            let v = self.vmas.get(to_area);
            (v.task, v.page_prot)
        };
        let from_root = match self.tasks.get(from_pid) {
            Some(t) => t.root,
            None => return false,
        };
        let Some(from_slot) = paging::walk(&self.phys, from_root, from_address) else {
            return false;
        };
        let from = from_slot.get(&self.phys);
        if !from.present() {
            return false;
        }
        // a dirty page can only come from a shared mapping to be shared
        if from.dirty() {
            if !from_shared {
                return false;
            }
            if from.write() {
                log::error!("[FAULT] writable, but dirty, shared page");
                return false;
            }
        }
        let frame = from.page();
        if self.phys.out_of_range(frame) || self.phys.is_reserved(frame) {
            return false;
        }
        // destination must have an empty slot waiting
        let to_root = match self.tasks.get(to_pid) {
            Some(t) => t.root,
            None => return false,
        };
        let Some(to_slot) = paging::walk(&self.phys, to_root, to_address) else {
            return false;
        };
        if !to_slot.get(&self.phys).none() {
            return false;
        }

        if let Some(new) = give_page {
            // In the swap cache it is dirty by implication, so only a
            // shared source can supply the copy.
            if self.swap.in_swap_cache(frame).is_some() {
                if !from_shared {
                    return false;
                }
                if !from.write() {
                    log::error!("[FAULT] unwritable, but dirty, shared page");
                    return false;
                }
            }
            self.phys.copy_page(frame, new);
            to_slot.set(&mut self.phys, Pte::mk_pte(new, to_prot));
            return true;
        }

        // Sharing outright: the swap cache cannot track two mappers, so
        // evict the entry now and let the source own dirtiness.
        if self.swap.in_swap_cache(frame).is_some() {
            if !from_shared {
                return false;
            }
            from_slot.set(&mut self.phys, from.mkdirty());
            if self.swap.delete_from_swap_cache(frame) {
                self.phys.free(frame, 0);
            }
        }
        self.phys.inc_ref(frame);
        to_slot.set(&mut self.phys, Pte::mk_pte(frame, to_prot));
        let from = from_slot.get(&self.phys);
        if !from.write() || from_shared {
            return true;
        }
        from_slot.set(&mut self.phys, from.wrprotect());
        let mut flush = FlushBatch::new();
        flush.all(from_pid);
        flush.commit(&mut self.tlb);
        true
    }

    /// Swap-in fault: the entry is non-present and non-zero. Segment
    /// attachments carry their own swap-in; everything else is a plain
    /// swap slot.
    fn do_swap_page(&mut self, vma_id: VmaId, address: u64, slot: PteRef, entry: Pte, write_access: bool) {
        let (pid, backing, shared, v_start, v_offset, page_prot) = {
            let v = self.vmas.get(vma_id);
            (v.task, v.backing.clone(), v.shared(), v.start, v.offset, v.page_prot)
        };

        if let VmaBacking::SharedSeg { .. } = backing {
            let seg_offset = address - v_start + v_offset;
            let page = self.shm_swap_in(vma_id, seg_offset, entry.raw());
            // Another faulter may have resolved the entry while we slept.
            if slot.get(&self.phys).raw() != entry.raw() {
                self.free_page(page.page());
                return;
            }
            let mut page = page;
            if self.phys.ref_count(page.page()) > 1 && !shared {
                page = page.wrprotect();
            }
            if let Some(task) = self.tasks.get_mut(pid) {
                task.rss += 1;
                task.maj_flt += 1;
            }
            slot.set(&mut self.phys, page);
            return;
        }

        // Generic path. A resident cached copy short-circuits the read.
        if let Some(cached) = self.swap.find_cached(entry.raw()) {
            self.phys.inc_ref(cached);
            self.swap.swap_free(entry.raw());
            let mut pte = Pte::mk_pte(cached, page_prot);
            if self.phys.ref_count(cached) > 1 && !shared {
                pte = pte.wrprotect();
            }
            if let Some(task) = self.tasks.get_mut(pid) {
                task.rss += 1;
                task.min_flt += 1;
            }
            slot.set(&mut self.phys, pte);
            return;
        }

        let Some(page) = self.get_free_page(gfp::GFP_KERNEL) else {
            self.oom(pid);
            let bad = self.bad_page();
            slot.set(&mut self.phys, bad);
            return;
        };
        {
            let MemorySystem { phys, swap, .. } = self;
            swap.read_swap_page(entry.raw(), page, phys);
        }
        if let Some(task) = self.tasks.get_mut(pid) {
            task.rss += 1;
            task.maj_flt += 1;
        }
        let mut pte = Pte::mk_pte(page, page_prot);
        if write_access {
            // The slot is dropped and the page starts out private dirty.
            self.swap.swap_free(entry.raw());
            pte = pte.mkwrite().mkdirty();
        } else if !shared {
            // Keep the slot: the cache remembers the clean copy so an
            // unchanged page can be evicted without rewriting.
            self.phys.inc_ref(page);
            self.swap.add_to_swap_cache(page, entry.raw());
            if self.phys.ref_count(page) > 1 {
                pte = pte.wrprotect();
            }
        } else {
            self.swap.swap_free(entry.raw());
        }
        slot.set(&mut self.phys, pte);
    }

    // --- mapping installers used by exec and drivers ---

    /// Map [address, address+size) to the shared zero page (read-only;
    /// the first write faults in a private frame).
    pub fn zeromap(&mut self, pid: Pid, address: u64, size: u64, page_prot: u64) -> Result<(), KernelError> {
        let zero = self.zero_frame;
        let MemorySystem { phys, swap, tlb, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        paging::zeromap_page_range(phys, swap, tlb, task, address, size, page_prot, zero)
    }

    /// Force-map a physical window (device memory or verbatim frames).
    pub fn remap(&mut self, pid: Pid, from: u64, offset: u64, size: u64, page_prot: u64) -> Result<(), KernelError> {
        let MemorySystem { phys, swap, tlb, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        paging::remap_page_range(phys, swap, tlb, task, from, offset, size, page_prot)
    }

    /// Drop the mappings of [address, address+size).
    pub fn unmap_range(&mut self, pid: Pid, address: u64, size: u64) -> Result<(), KernelError> {
        let MemorySystem { phys, swap, tlb, tasks, .. } = self;
        let task = tasks.get_mut(pid).ok_or(KernelError::InvalidArg)?;
        paging::unmap_page_range(phys, swap, tlb, task, address, size);
        Ok(())
    }

    /// Install a pre-filled frame writable+dirty at `address` (exec uses
    /// this for the initial stack and environment pages).
    pub fn put_dirty_page(&mut self, pid: Pid, frame: FrameNo, address: u64) -> Result<(), KernelError> {
        if self.phys.ref_count(frame) != 1 {
            log::error!("[FAULT] mem_map disagrees with frame {} at {:#x}", frame, address);
        }
        let root = self.tasks.get(pid).ok_or(KernelError::InvalidArg)?.root;
        let pmd = match paging::pmd_alloc(&mut self.phys, root, address) {
            Ok(t) => t,
            Err(e) => {
                self.phys.free(frame, 0);
                self.oom(pid);
                return Err(e);
            }
        };
        let leaf = match paging::pte_alloc(&mut self.phys, pmd, address) {
            Ok(t) => t,
            Err(e) => {
                self.phys.free(frame, 0);
                self.oom(pid);
                return Err(e);
            }
        };
        let slot = PteRef { table: leaf, index: paging::pte_index(address) };
        if !slot.get(&self.phys).none() {
            log::error!("[FAULT] put_dirty_page: page already exists at {:#x}", address);
            slot.clear(&mut self.phys);
            let mut flush = FlushBatch::new();
            flush.all(pid);
            flush.commit(&mut self.tlb);
        }
        slot.set(&mut self.phys, Pte::mk_pte(frame, paging::prot::PAGE_COPY).mkdirty().mkwrite());
        if let Some(task) = self.tasks.get_mut(pid) {
            task.rss += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::PROTECTION_MAP;
    use crate::memory::vma::Vma;
    use crate::memory::{MemoryConfig, MemorySystem};

    const PRIVATE_RO: u32 = vm::VM_READ | vm::VM_MAYREAD;
    const PRIVATE_RW: u32 =
        vm::VM_READ | vm::VM_WRITE | vm::VM_MAYREAD | vm::VM_MAYWRITE;
    const SHARED_RW: u32 = PRIVATE_RW | vm::VM_SHARED | vm::VM_MAYSHARE;

    fn add_vma(ms: &mut MemorySystem, pid: Pid, start: u64, pages: u64, flags: u32, backing: VmaBacking) {
        let id = ms.vmas.alloc(Vma {
            start,
            end: start + pages * PAGE_SIZE as u64,
            flags,
            page_prot: PROTECTION_MAP[(flags & 0xf) as usize],
            offset: 0,
            backing,
            task: pid,
            share_next: None,
            share_prev: None,
        });
        let MemorySystem { vmas, files, tasks, .. } = ms;
        vma::insert_vm_struct(vmas, files, tasks.get_mut(pid).unwrap(), id);
    }

    fn file_with_pattern(ms: &mut MemorySystem) -> vma::FileId {
        let mut data = alloc::vec![0u8; 2 * PAGE_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        ms.files.create(data)
    }

    #[test]
    fn anonymous_fault_installs_a_zeroed_writable_page() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("anon").unwrap();
        add_vma(&mut ms, pid, 0x40_0000, 1, PRIVATE_RW, VmaBacking::Anonymous);
        ms.handle_mm_fault(pid, 0x40_0123, false).unwrap();
        let root = ms.tasks.get(pid).unwrap().root;
        let pte = paging::walk(&ms.phys, root, 0x40_0000).unwrap().get(&ms.phys);
        assert!(pte.present() && pte.write());
        assert!(ms.phys.page(pte.page()).iter().all(|&b| b == 0));
        assert_eq!(ms.tasks.get(pid).unwrap().rss, 1);
    }

    #[test]
    fn fault_outside_mappings_is_a_bad_address() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("bad").unwrap();
        assert_eq!(ms.handle_mm_fault(pid, 0x40_0000, false), Err(KernelError::BadAddress));
        add_vma(&mut ms, pid, 0x40_0000, 1, PRIVATE_RO, VmaBacking::Anonymous);
        assert_eq!(ms.handle_mm_fault(pid, 0x40_0000, true), Err(KernelError::BadAddress));
    }

    #[test]
    fn second_reader_shares_the_file_frame() {
        let mut ms = MemorySystem::new_default();
        let file = file_with_pattern(&mut ms);
        let a = ms.create_task("a").unwrap();
        let b = ms.create_task("b").unwrap();
        ms.files.iget(file);
        add_vma(&mut ms, a, 0x40_0000, 2, PRIVATE_RO, VmaBacking::File { file });
        add_vma(&mut ms, b, 0x80_0000, 2, PRIVATE_RO, VmaBacking::File { file });

        ms.handle_mm_fault(a, 0x40_0000, false).unwrap();
        ms.handle_mm_fault(b, 0x80_0000, false).unwrap();

        let a_root = ms.tasks.get(a).unwrap().root;
        let b_root = ms.tasks.get(b).unwrap().root;
        let a_pte = paging::walk(&ms.phys, a_root, 0x40_0000).unwrap().get(&ms.phys);
        let b_pte = paging::walk(&ms.phys, b_root, 0x80_0000).unwrap().get(&ms.phys);
        assert_eq!(a_pte.page(), b_pte.page());
        assert_eq!(ms.phys.ref_count(a_pte.page()), 2);
        assert_eq!(ms.phys.page(a_pte.page())[5], 5);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn private_writer_gets_an_exclusive_copy() {
        let mut ms = MemorySystem::new_default();
        let file = file_with_pattern(&mut ms);
        let a = ms.create_task("a").unwrap();
        let b = ms.create_task("b").unwrap();
        ms.files.iget(file);
        add_vma(&mut ms, a, 0x40_0000, 2, PRIVATE_RO, VmaBacking::File { file });
        add_vma(&mut ms, b, 0x80_0000, 2, PRIVATE_RW, VmaBacking::File { file });

        ms.handle_mm_fault(a, 0x40_0000, false).unwrap();
        ms.handle_mm_fault(b, 0x80_0000, true).unwrap();

        let a_root = ms.tasks.get(a).unwrap().root;
        let b_root = ms.tasks.get(b).unwrap().root;
        let a_pte = paging::walk(&ms.phys, a_root, 0x40_0000).unwrap().get(&ms.phys);
        let b_pte = paging::walk(&ms.phys, b_root, 0x80_0000).unwrap().get(&ms.phys);
        assert_ne!(a_pte.page(), b_pte.page());
        // The exclusive copy installs read-only; the re-fault restores the
        // write bit on the now sole-owned frame.
        ms.handle_mm_fault(b, 0x80_0000, true).unwrap();
        let b_pte = paging::walk(&ms.phys, b_root, 0x80_0000).unwrap().get(&ms.phys);
        assert!(b_pte.write());
        assert_eq!(ms.phys.page(a_pte.page())[..64], ms.phys.page(b_pte.page())[..64]);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn swapped_page_comes_back_through_the_cache() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("swapper-client").unwrap();
        let addr = 0x40_0000u64;
        add_vma(&mut ms, pid, addr, 1, PRIVATE_RW, VmaBacking::Anonymous);
        ms.write_user(pid, addr, b"cold data").unwrap();

        // Push the page out by hand, standing in for an external policy.
        let root = ms.tasks.get(pid).unwrap().root;
        let slot = paging::walk(&ms.phys, root, addr).unwrap();
        let old = slot.get(&ms.phys);
        let id = ms.swap.get_swap_page();
        assert_ne!(id, 0);
        {
            let MemorySystem { phys, swap, .. } = &mut ms;
            swap.write_swap_page(id, old.page(), phys);
        }
        slot.set(&mut ms.phys, Pte::from_raw(id));
        ms.phys.free(old.page(), 0);
        ms.tasks.get_mut(pid).unwrap().rss -= 1;

        // Read access swaps it in clean and cached.
        let mut buf = [0u8; 9];
        ms.read_user(pid, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"cold data");
        let pte = paging::walk(&ms.phys, root, addr).unwrap().get(&ms.phys);
        assert!(!pte.write());
        assert_eq!(ms.swap.in_swap_cache(pte.page()), Some(id));
        assert_eq!(ms.swap.slot_refs(id), 1);
        assert_eq!(ms.phys.ref_count(pte.page()), 2);
        assert_eq!(ms.verify_frame_refcounts(), 0);

        // A later write breaks away from the cached copy.
        ms.write_user(pid, addr, b"warm data").unwrap();
        ms.read_user(pid, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"warm data");
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn allocation_failure_degrades_to_bad_page_and_a_signal() {
        let mut ms = MemorySystem::new(MemoryConfig {
            frames: 32,
            dma_frames: 8,
            swap_slots: 8,
            swap_device: None,
        });
        let pid = ms.create_task("doomed").unwrap();
        add_vma(&mut ms, pid, 0x40_0000, 64, PRIVATE_RW, VmaBacking::Anonymous);
        // Burn every remaining frame through the fault path.
        let mut addr = 0x40_0000u64;
        loop {
            ms.handle_mm_fault(pid, addr, true).unwrap();
            if ms.tasks.get(pid).unwrap().pending_signal.is_some() {
                break;
            }
            addr += PAGE_SIZE as u64;
            assert!(addr < 0x44_0000, "exhaustion never happened");
        }
        assert_eq!(ms.tasks.get(pid).unwrap().pending_signal, Some(crate::process::SIGKILL));
        // The failing address landed on the sentinel frame.
        let root = ms.tasks.get(pid).unwrap().root;
        let pte = paging::walk(&ms.phys, root, addr).unwrap().get(&ms.phys);
        assert_eq!(pte.page(), ms.bad_frame);
    }

    #[test]
    fn remap_installs_device_windows_without_refcounts() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("driver").unwrap();
        let total = ms.phys.total_frames() as u64;
        // A window past the end of memory stands in for MMIO.
        let mmio = total * PAGE_SIZE as u64;
        ms.remap(pid, 0x50_0000, mmio, 2 * PAGE_SIZE as u64, paging::prot::PAGE_SHARED).unwrap();
        let root = ms.tasks.get(pid).unwrap().root;
        let pte = paging::walk(&ms.phys, root, 0x50_0000).unwrap().get(&ms.phys);
        assert!(pte.present());
        assert_eq!(pte.page(), total as usize);
        // Tearing the range down must not touch mem_map.
        ms.unmap_range(pid, 0x50_0000, 2 * PAGE_SIZE as u64).unwrap();
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn zeromap_points_at_the_shared_zero_page() {
        let mut ms = MemorySystem::new_default();
        let pid = ms.create_task("z").unwrap();
        ms.zeromap(pid, 0x60_0000, 2 * PAGE_SIZE as u64, paging::prot::PAGE_COPY).unwrap();
        let root = ms.tasks.get(pid).unwrap().root;
        let pte = paging::walk(&ms.phys, root, 0x60_0000).unwrap().get(&ms.phys);
        assert_eq!(pte.page(), ms.zero_frame);
        assert!(!pte.write());
    }
}
