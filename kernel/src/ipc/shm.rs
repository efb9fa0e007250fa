//! System-V shared memory segments
//!
//! Keyed segments with per-page swap-capable backing. A segment owns a
//! page table of PTE-encoded words (resident frame or swap id), allocated
//! from the pooled allocator; attachments are ordinary VMAs whose leaf
//! entries carry a non-present signature code (segment id + page index)
//! that the swap-in fault op decodes. Attachers of one segment form a
//! circular ring through the VMA pool.
//!
//! Slot protocol: UNUSED, RESERVING (allocation in flight, scanners sleep
//! on the directory channel), LIVE.

use alloc::vec::Vec;

use super::{ipcperms, IpcPerm, Key, IPC_CREAT, IPC_EXCL, IPC_PRIVATE, S_IRUGO, S_IRWXUGO, S_IWUGO};
use crate::logger;
use crate::memory::frame::{gfp, FrameAllocator, FrameNo};
use crate::memory::paging::{self, FlushBatch, Pte, PteRef};
use crate::memory::swap::SHM_SWP_TYPE;
use crate::memory::vma::{self, vm, Vma, VmaBacking, VmaId};
use crate::memory::{KernelError, MemorySystem, PAGE_SHIFT, PAGE_SIZE};
use crate::process::Pid;
use crate::sched::{SleepMode, WaitChannel};

/// Maximum live segments
pub const SHMMNI: usize = 128;
/// Maximum segment size in bytes
pub const SHMMAX: usize = 0x100_000;
/// Minimum segment size in bytes
pub const SHMMIN: usize = 1;
/// System-wide cap on shared pages
pub const SHMALL: usize = 2048;
/// Per-process attach limit (reported by IPC_INFO)
pub const SHMSEG: usize = 64;
/// Attach-address alignment
pub const SHMLBA: u64 = 0x4000;

// shmat flags
pub const SHM_RDONLY: u32 = 0o10000;
pub const SHM_RND: u32 = 0o20000;
pub const SHM_REMAP: u32 = 0o40000;

// mode bits riding in IpcPerm::mode
pub const SHM_DEST: u16 = 0o1000;
pub const SHM_LOCKED: u16 = 0o2000;

// shmctl commands
pub const IPC_RMID: u32 = 0;
pub const IPC_SET: u32 = 1;
pub const IPC_STAT: u32 = 2;
pub const IPC_INFO: u32 = 3;
pub const SHM_LOCK: u32 = 11;
pub const SHM_UNLOCK: u32 = 12;
pub const SHM_STAT: u32 = 13;
pub const SHM_INFO: u32 = 14;

// Signature layout: marker bit | slot id | page index, present bit clear.
pub const SHM_ID_SHIFT: u32 = 8;
pub const SHM_ID_MASK: u64 = 0xfff;
pub const SHM_IDX_SHIFT: u32 = 20;
pub const SHM_IDX_MASK: u64 = 0xffff;

fn signature(slot: usize) -> u64 {
    SHM_SWP_TYPE | ((slot as u64) << SHM_ID_SHIFT)
}

fn sig_id(code: u64) -> usize {
    ((code >> SHM_ID_SHIFT) & SHM_ID_MASK) as usize
}

fn sig_idx(code: u64) -> usize {
    ((code >> SHM_IDX_SHIFT) & SHM_IDX_MASK) as usize
}

/// One live segment.
pub struct ShmSegment {
    pub perm: IpcPerm,
    /// Requested size in bytes
    pub segsz: usize,
    pub npages: usize,
    /// Arena address of the kalloc'd per-page table (npages words)
    pub pages: usize,
    /// Ring of attaching VMAs
    pub attaches: Option<VmaId>,
    pub nattch: i32,
    pub cpid: Pid,
    pub lpid: Pid,
    pub atime: u64,
    pub dtime: u64,
    pub ctime: u64,
}

enum SlotState {
    Unused,
    /// Allocation in flight; scanners sleep until it resolves
    Reserving,
    Live(ShmSegment),
}

/// The segment directory plus global accounting.
pub struct ShmDirectory {
    segs: Vec<SlotState>,
    /// Identity generation; makes recycled slot ids recognizably stale
    seq: u32,
    max_shmid: usize,
    used_segs: usize,
    pub shm_tot: usize,
    pub shm_rss: usize,
    pub shm_swp: usize,
    pub swap_attempts: u64,
    pub swap_successes: u64,
    /// Round-robin eviction cursor
    swap_id: usize,
    swap_idx: usize,
    lock: WaitChannel,
}

impl ShmDirectory {
    pub fn new() -> Self {
        let mut segs = Vec::with_capacity(SHMMNI);
        for _ in 0..SHMMNI {
            segs.push(SlotState::Unused);
        }
        Self {
            segs,
            seq: 0,
            max_shmid: 0,
            used_segs: 0,
            shm_tot: 0,
            shm_rss: 0,
            shm_swp: 0,
            swap_attempts: 0,
            swap_successes: 0,
            swap_id: 0,
            swap_idx: 0,
            lock: WaitChannel::new("shm"),
        }
    }

    fn seg(&self, slot: usize) -> Option<&ShmSegment> {
        match self.segs.get(slot) {
            Some(SlotState::Live(seg)) => Some(seg),
            _ => None,
        }
    }

    fn seg_mut(&mut self, slot: usize) -> Option<&mut ShmSegment> {
        match self.segs.get_mut(slot) {
            Some(SlotState::Live(seg)) => Some(seg),
            _ => None,
        }
    }

    pub fn used_segments(&self) -> usize {
        self.used_segs
    }

    /// Frames currently resident in segment page tables (for the
    /// refcount audit; each holds one segment reference).
    pub fn resident_frames(&self, phys: &FrameAllocator) -> Vec<FrameNo> {
        let mut out = Vec::new();
        for state in &self.segs {
            if let SlotState::Live(seg) = state {
                for idx in 0..seg.npages {
                    let pte = Pte::from_raw(phys.read_u64_at(seg.pages + idx * 8));
                    if pte.present() {
                        out.push(pte.page());
                    }
                }
            }
        }
        out
    }
}

impl MemorySystem {
    fn shm_findkey(&mut self, key: Key) -> Option<usize> {
        let mut guard = 0;
        let mut id = 0;
        while id <= self.shm.max_shmid {
            match &self.shm.segs[id] {
                SlotState::Reserving => {
                    // Another creator holds the slot; wait for it to
                    // resolve and rescan.
                    self.shm.lock.sleep_on(SleepMode::Uninterruptible, None);
                    guard += 1;
                    if guard > SHMMNI {
                        log::error!("[SHM] reserving slot {} never resolved", id);
                        return None;
                    }
                }
                SlotState::Live(seg) if seg.perm.key == key => return Some(id),
                _ => id += 1,
            }
        }
        None
    }

    /// Allocate a new segment. The slot sits in RESERVING while the
    /// descriptor table is allocated, so concurrent scanners block
    /// instead of reading a half-built segment.
    fn shm_newseg(&mut self, pid: Pid, key: Key, shmflg: u32, size: usize) -> Result<i64, KernelError> {
        let numpages = (size + PAGE_SIZE - 1) >> PAGE_SHIFT;
        if size < SHMMIN {
            return Err(KernelError::InvalidArg);
        }
        if self.shm.shm_tot + numpages >= SHMALL {
            return Err(KernelError::NoSpace);
        }
        let slot = match self.shm.segs.iter().position(|s| matches!(s, SlotState::Unused)) {
            Some(slot) => slot,
            None => return Err(KernelError::NoSpace),
        };
        self.shm.segs[slot] = SlotState::Reserving;

        // May sleep; the RESERVING marker keeps the slot ours meanwhile.
        let pages = match self.kalloc(numpages * 8, gfp::GFP_KERNEL) {
            Ok(p) => p,
            Err(e) => {
                self.shm.segs[slot] = SlotState::Unused;
                self.shm.lock.wake_all();
                return Err(e);
            }
        };
        for idx in 0..numpages {
            self.phys.write_u64_at(pages + idx * 8, 0);
        }

        let (euid, egid) = {
            let t = self.tasks.get(pid).expect("shm_newseg: no such task");
            (t.euid, t.egid)
        };
        let seq = self.shm.seq;
        let seg = ShmSegment {
            perm: IpcPerm {
                key,
                uid: euid,
                gid: egid,
                cuid: euid,
                cgid: egid,
                mode: (shmflg as u16) & S_IRWXUGO,
                seq,
            },
            segsz: size,
            npages: numpages,
            pages,
            attaches: None,
            nattch: 0,
            cpid: pid,
            lpid: 0,
            atime: 0,
            dtime: 0,
            ctime: logger::get_ticks(),
        };
        self.shm.shm_tot += numpages;
        if slot > self.shm.max_shmid {
            self.shm.max_shmid = slot;
        }
        self.shm.segs[slot] = SlotState::Live(seg);
        self.shm.used_segs += 1;
        self.shm.lock.wake_all();
        log::debug!("[SHM] new segment: slot {} key {} size {}", slot, key, size);
        Ok(seq as i64 * SHMMNI as i64 + slot as i64)
    }

    /// shmget: find or create the segment for `key`.
    pub fn sys_shmget(&mut self, pid: Pid, key: Key, size: usize, shmflg: u32) -> i64 {
        if size > SHMMAX {
            return crate::syscall::errno::EINVAL;
        }
        if key == IPC_PRIVATE {
            return match self.shm_newseg(pid, key, shmflg, size) {
                Ok(id) => id,
                Err(e) => e.errno(),
            };
        }
        let slot = match self.shm_findkey(key) {
            Some(slot) => slot,
            None => {
                if shmflg & IPC_CREAT == 0 {
                    return crate::syscall::errno::ENOENT;
                }
                return match self.shm_newseg(pid, key, shmflg, size) {
                    Ok(id) => id,
                    Err(e) => e.errno(),
                };
            }
        };
        if shmflg & IPC_CREAT != 0 && shmflg & IPC_EXCL != 0 {
            return crate::syscall::errno::EEXIST;
        }
        let granted = {
            let task = self.tasks.get(pid).expect("shmget: no such task");
            let seg = self.shm.seg(slot).unwrap();
            if seg.perm.mode & SHM_DEST != 0 {
                return crate::syscall::errno::EIDRM;
            }
            if size > seg.segsz {
                return crate::syscall::errno::EINVAL;
            }
            ipcperms(&seg.perm, (shmflg as u16) & S_IRWXUGO, task)
        };
        if !granted {
            return crate::syscall::errno::EACCES;
        }
        let seg = self.shm.seg(slot).unwrap();
        seg.perm.seq as i64 * SHMMNI as i64 + slot as i64
    }

    /// Free a segment's pages, swap slots and descriptor. Only called
    /// once the attach count has dropped (or the segment never attached).
    fn killseg(&mut self, slot: usize) {
        let seg = match core::mem::replace(&mut self.shm.segs[slot], SlotState::Unused) {
            SlotState::Live(seg) => seg,
            other => {
                log::error!("[SHM] killseg called on unused slot {}", slot);
                self.shm.segs[slot] = other;
                return;
            }
        };
        // Recycled ids must not validate against the old encoding.
        self.shm.seq = (self.shm.seq + 1) % (u32::MAX / SHMMNI as u32);
        self.shm.used_segs -= 1;
        while self.shm.max_shmid > 0
            && matches!(self.shm.segs[self.shm.max_shmid], SlotState::Unused)
        {
            self.shm.max_shmid -= 1;
        }
        if seg.pages == 0 {
            log::error!("[SHM] killseg: slot {} has no page table", slot);
            return;
        }
        for idx in 0..seg.npages {
            let pte = Pte::from_raw(self.phys.read_u64_at(seg.pages + idx * 8));
            if pte.none() {
                continue;
            }
            if pte.present() {
                self.phys.free(pte.page(), 0);
                self.shm.shm_rss -= 1;
            } else {
                self.swap.swap_free(pte.raw());
                self.shm.shm_swp -= 1;
            }
        }
        let npages = seg.npages;
        self.kfree(seg.pages, npages * 8);
        self.shm.shm_tot -= npages;
        log::debug!("[SHM] killed slot {}", slot);
    }

    /// shmat: wire a segment into the caller's address space.
    pub fn sys_shmat(&mut self, pid: Pid, shmid: i64, shmaddr: u64, shmflg: u32, raddr: &mut u64) -> i64 {
        if shmid < 0 {
            return crate::syscall::errno::EINVAL;
        }
        let slot = shmid as usize % SHMMNI;
        let (npages, seg_seq) = match self.shm.seg(slot) {
            Some(seg) => (seg.npages, seg.perm.seq),
            None => return crate::syscall::errno::EINVAL,
        };
        let len = (npages * PAGE_SIZE) as u64;

        let addr = if shmaddr == 0 {
            if shmflg & SHM_REMAP != 0 {
                return crate::syscall::errno::EINVAL;
            }
            let task = self.tasks.get(pid).expect("shmat: no such task");
            match vma::get_unmapped_area(&self.vmas, task, len, SHMLBA) {
                Some(a) => a,
                None => return crate::syscall::errno::ENOMEM,
            }
        } else if shmaddr & (SHMLBA - 1) != 0 {
            if shmflg & SHM_RND != 0 {
                shmaddr & !(SHMLBA - 1)
            } else {
                return crate::syscall::errno::EINVAL;
            }
        } else {
            shmaddr
        };

        {
            let task = self.tasks.get(pid).expect("shmat: no such task");
            if addr > task.start_stack - crate::memory::STACK_GUARD - len {
                return crate::syscall::errno::EINVAL;
            }
            if shmflg & SHM_REMAP == 0
                && vma::find_vma_intersection(&self.vmas, task, addr, addr + len).is_some()
            {
                return crate::syscall::errno::EINVAL;
            }
            let seg = self.shm.seg(slot).unwrap();
            let want = if shmflg & SHM_RDONLY != 0 { S_IRUGO } else { S_IRUGO | S_IWUGO };
            if !ipcperms(&seg.perm, want, task) {
                return crate::syscall::errno::EACCES;
            }
        }
        if seg_seq as i64 != shmid / SHMMNI as i64 {
            return crate::syscall::errno::EIDRM;
        }

        let rdonly = shmflg & SHM_RDONLY != 0;
        let vma_record = Vma {
            start: addr,
            end: addr + len,
            flags: vm::VM_SHM
                | vm::VM_MAYSHARE
                | vm::VM_SHARED
                | vm::VM_MAYREAD
                | vm::VM_MAYEXEC
                | vm::VM_READ
                | vm::VM_EXEC
                | if rdonly { 0 } else { vm::VM_MAYWRITE | vm::VM_WRITE },
            page_prot: if rdonly { paging::prot::PAGE_READONLY } else { paging::prot::PAGE_SHARED },
            offset: 0,
            backing: VmaBacking::SharedSeg { signature: signature(slot) },
            task: pid,
            share_next: None,
            share_prev: None,
        };

        // Count the attach before any wiring so a racing rmid cannot
        // destroy the segment under us.
        self.shm.seg_mut(slot).unwrap().nattch += 1;

        match self.shm_map(pid, slot, vma_record) {
            Ok(vma_id) => {
                let MemorySystem { shm, vmas, .. } = self;
                let seg = shm.seg_mut(slot).unwrap();
                let mut head = seg.attaches;
                vmas.ring_insert(&mut head, vma_id);
                seg.attaches = head;
                seg.lpid = pid;
                seg.atime = logger::get_ticks();
                *raddr = addr;
                0
            }
            Err(e) => {
                let dead = {
                    let seg = self.shm.seg_mut(slot).unwrap();
                    seg.nattch -= 1;
                    seg.nattch <= 0 && seg.perm.mode & SHM_DEST != 0
                };
                if dead {
                    self.killseg(slot);
                }
                e.errno()
            }
        }
    }

    /// Clear the landing range, insert the attach VMA, and fill its leaf
    /// entries with signature codes the fault handler recognizes.
    fn shm_map(&mut self, pid: Pid, slot: usize, vma_record: Vma) -> Result<VmaId, KernelError> {
        let (start, end) = (vma_record.start, vma_record.end);
        self.do_munmap(pid, start, end - start)?;

        let vma_id = self.vmas.alloc(vma_record);
        {
            let MemorySystem { vmas, files, tasks, .. } = self;
            let task = tasks.get_mut(pid).unwrap();
            vma::insert_vm_struct(vmas, files, task, vma_id);
            vma::merge_segments(vmas, files, task, start, end);
        }

        let root = self.tasks.get(pid).unwrap().root;
        let mut code = signature(slot);
        let mut addr = start;
        let result = loop {
            if addr >= end {
                break Ok(vma_id);
            }
            let pmd = match paging::pmd_alloc(&mut self.phys, root, addr) {
                Ok(t) => t,
                Err(e) => break Err(e),
            };
            let leaf = match paging::pte_alloc(&mut self.phys, pmd, addr) {
                Ok(t) => t,
                Err(e) => break Err(e),
            };
            let slot_ref = PteRef { table: leaf, index: paging::pte_index(addr) };
            slot_ref.set(&mut self.phys, Pte::from_raw(code));
            code += 1 << SHM_IDX_SHIFT;
            addr += PAGE_SIZE as u64;
        };
        if let Err(e) = result {
            // Unwind the partial attach: the signatures installed so far
            // are plain non-present codes the unmap path ignores.
            self.tasks.get_mut(pid).unwrap().vmas.retain(|&x| x != vma_id);
            let MemorySystem { phys, swap, tlb, tasks, .. } = self;
            let task = tasks.get_mut(pid).unwrap();
            paging::unmap_page_range(phys, swap, tlb, task, start, end - start);
            self.vmas.remove(vma_id);
            return Err(e);
        }
        let mut flush = FlushBatch::new();
        flush.all(pid);
        flush.commit(&mut self.tlb);
        result
    }

    /// Fork notification for one attach: link the child's VMA into the
    /// ring and count it.
    pub(crate) fn shm_open(&mut self, vma_id: VmaId) {
        let (code, pid) = {
            let v = self.vmas.get(vma_id);
            match v.backing {
                VmaBacking::SharedSeg { signature } => (signature, v.task),
                _ => return,
            }
        };
        let slot = sig_id(code);
        if self.shm.seg(slot).is_none() {
            log::error!("[SHM] shm_open: unused slot {}", slot);
            return;
        }
        let MemorySystem { shm, vmas, .. } = self;
        let seg = shm.seg_mut(slot).unwrap();
        let mut head = seg.attaches;
        vmas.ring_insert(&mut head, vma_id);
        seg.attaches = head;
        seg.nattch += 1;
        seg.atime = logger::get_ticks();
        seg.lpid = pid;
    }

    /// Detach one VMA: drop its page references, leave the ring, and kill
    /// the segment when the last attach of a destroyed segment goes.
    pub(crate) fn shm_close(&mut self, vma_id: VmaId) {
        let (code, pid, start, end) = {
            let v = self.vmas.get(vma_id);
            match v.backing {
                VmaBacking::SharedSeg { signature } => (signature, v.task, v.start, v.end),
                _ => return,
            }
        };
        {
            let MemorySystem { phys, swap, tlb, tasks, .. } = self;
            if let Some(task) = tasks.get_mut(pid) {
                paging::unmap_page_range(phys, swap, tlb, task, start, end - start);
            }
        }
        let slot = sig_id(code);
        if self.shm.seg(slot).is_none() {
            log::error!("[SHM] shm_close: attach list inconsistent, slot {}", slot);
            return;
        }
        let dead = {
            let MemorySystem { shm, vmas, .. } = self;
            let seg = shm.seg_mut(slot).unwrap();
            let mut head = seg.attaches;
            vmas.ring_remove(&mut head, vma_id);
            seg.attaches = head;
            seg.lpid = pid;
            seg.dtime = logger::get_ticks();
            seg.nattch -= 1;
            seg.nattch <= 0 && seg.perm.mode & SHM_DEST != 0
        };
        if dead {
            self.killseg(slot);
        }
    }

    /// shmdt: detach every shared VMA that started life at `shmaddr`.
    pub fn sys_shmdt(&mut self, pid: Pid, shmaddr: u64) -> i64 {
        let Some(task) = self.tasks.get(pid) else {
            return crate::syscall::errno::EINVAL;
        };
        let matches: Vec<(u64, u64)> = task
            .vmas
            .iter()
            .filter_map(|&id| {
                let v = self.vmas.get(id);
                if matches!(v.backing, VmaBacking::SharedSeg { .. }) && v.start - v.offset == shmaddr {
                    Some((v.start, v.end))
                } else {
                    None
                }
            })
            .collect();
        for (start, end) in matches {
            let _ = self.do_munmap(pid, start, end - start);
        }
        0
    }

    /// shmctl: stat, set, destroy, lock, and the global info commands.
    pub fn sys_shmctl(&mut self, pid: Pid, shmid: i64, cmd: u32, buf: ShmCtl<'_>) -> i64 {
        if shmid < 0 {
            return crate::syscall::errno::EINVAL;
        }
        // The info commands interpret shmid differently and skip the
        // seq validation.
        match cmd {
            IPC_INFO => {
                let ShmCtl::Limits(out) = buf else {
                    return crate::syscall::errno::EFAULT;
                };
                *out = ShmLimits {
                    shmmni: SHMMNI,
                    shmmax: SHMMAX,
                    shmmin: SHMMIN,
                    shmall: SHMALL,
                    shmseg: SHMSEG,
                };
                return self.shm.max_shmid as i64;
            }
            SHM_INFO => {
                let ShmCtl::Info(out) = buf else {
                    return crate::syscall::errno::EFAULT;
                };
                *out = ShmInfo {
                    used_ids: self.shm.used_segs,
                    shm_tot: self.shm.shm_tot,
                    shm_rss: self.shm.shm_rss,
                    shm_swp: self.shm.shm_swp,
                    swap_attempts: self.shm.swap_attempts,
                    swap_successes: self.shm.swap_successes,
                };
                return self.shm.max_shmid as i64;
            }
            SHM_STAT => {
                let ShmCtl::Stat(out) = buf else {
                    return crate::syscall::errno::EFAULT;
                };
                // shmid is a raw slot index here.
                let slot = shmid as usize;
                if slot > self.shm.max_shmid {
                    return crate::syscall::errno::EINVAL;
                }
                let task = self.tasks.get(pid).expect("shmctl: no such task");
                let Some(seg) = self.shm.seg(slot) else {
                    return crate::syscall::errno::EINVAL;
                };
                if !ipcperms(&seg.perm, S_IRUGO, task) {
                    return crate::syscall::errno::EACCES;
                }
                *out = stat_of(seg);
                return seg.perm.seq as i64 * SHMMNI as i64 + slot as i64;
            }
            _ => {}
        }

        let slot = shmid as usize % SHMMNI;
        let Some(seg) = self.shm.seg(slot) else {
            return crate::syscall::errno::EINVAL;
        };
        if seg.perm.seq as i64 != shmid / SHMMNI as i64 {
            return crate::syscall::errno::EIDRM;
        }

        match (cmd, buf) {
            (IPC_STAT, ShmCtl::Stat(out)) => {
                let task = self.tasks.get(pid).expect("shmctl: no such task");
                let seg = self.shm.seg(slot).unwrap();
                if !ipcperms(&seg.perm, S_IRUGO, task) {
                    return crate::syscall::errno::EACCES;
                }
                *out = stat_of(seg);
                0
            }
            (IPC_SET, ShmCtl::Set(new)) => {
                let allowed = {
                    let task = self.tasks.get(pid).unwrap();
                    let seg = self.shm.seg(slot).unwrap();
                    task.suser() || task.euid == seg.perm.uid || task.euid == seg.perm.cuid
                };
                if !allowed {
                    return crate::syscall::errno::EPERM;
                }
                let seg = self.shm.seg_mut(slot).unwrap();
                seg.perm.uid = new.perm.uid;
                seg.perm.gid = new.perm.gid;
                seg.perm.mode = (seg.perm.mode & !S_IRWXUGO) | (new.perm.mode & S_IRWXUGO);
                seg.ctime = logger::get_ticks();
                0
            }
            (IPC_RMID, _) => {
                let allowed = {
                    let task = self.tasks.get(pid).unwrap();
                    let seg = self.shm.seg(slot).unwrap();
                    task.suser() || task.euid == seg.perm.uid || task.euid == seg.perm.cuid
                };
                if !allowed {
                    return crate::syscall::errno::EPERM;
                }
                let kill = {
                    let seg = self.shm.seg_mut(slot).unwrap();
                    seg.perm.mode |= SHM_DEST;
                    seg.nattch <= 0
                };
                if kill {
                    self.killseg(slot);
                }
                0
            }
            (SHM_LOCK, _) => {
                let task = self.tasks.get(pid).unwrap();
                if !task.suser() {
                    return crate::syscall::errno::EPERM;
                }
                let seg = self.shm.seg_mut(slot).unwrap();
                if seg.perm.mode & SHM_LOCKED != 0 {
                    return crate::syscall::errno::EINVAL;
                }
                seg.perm.mode |= SHM_LOCKED;
                0
            }
            (SHM_UNLOCK, _) => {
                let task = self.tasks.get(pid).unwrap();
                if !task.suser() {
                    return crate::syscall::errno::EPERM;
                }
                let seg = self.shm.seg_mut(slot).unwrap();
                if seg.perm.mode & SHM_LOCKED == 0 {
                    return crate::syscall::errno::EINVAL;
                }
                seg.perm.mode &= !SHM_LOCKED;
                0
            }
            (IPC_STAT | IPC_SET, _) => crate::syscall::errno::EFAULT,
            _ => crate::syscall::errno::EINVAL,
        }
    }

    /// Evict one aged shared page to swap. Round-robin over segments and
    /// pages, second-chance on the accessed bit. The victim frame is
    /// pinned across the attacher rewrite so the final reference check is
    /// sound. Returns true when a page went out.
    pub fn shm_swap(&mut self, prio: u32) -> bool {
        let mut counter = (self.shm.shm_rss >> prio) as i64;
        if counter == 0 {
            return false;
        }
        let swap_nr = self.swap.get_swap_page();
        if swap_nr == 0 {
            return false;
        }

        let mut looped = false;
        let mut flush = FlushBatch::new();
        loop {
            // Find a swappable segment at the cursor.
            let (slot, npages, pages) = loop {
                let candidate = self.shm.swap_id;
                let ok = match self.shm.seg(candidate) {
                    Some(seg) => seg.perm.mode & SHM_LOCKED == 0,
                    None => false,
                };
                if ok {
                    let seg = self.shm.seg(candidate).unwrap();
                    break (candidate, seg.npages, seg.pages);
                }
                self.shm.swap_idx = 0;
                self.shm.swap_id += 1;
                if self.shm.swap_id > self.shm.max_shmid {
                    if looped {
                        self.swap.swap_free(swap_nr);
                        flush.commit(&mut self.tlb);
                        return false;
                    }
                    looped = true;
                    self.shm.swap_id = 0;
                }
            };

            // Scan this segment's pages from the cursor.
            'table: loop {
                let idx = self.shm.swap_idx;
                self.shm.swap_idx += 1;
                if idx >= npages {
                    self.shm.swap_idx = 0;
                    self.shm.swap_id += 1;
                    if self.shm.swap_id > self.shm.max_shmid {
                        if looped {
                            self.swap.swap_free(swap_nr);
                            flush.commit(&mut self.tlb);
                            return false;
                        }
                        looped = true;
                        self.shm.swap_id = 0;
                    }
                    break 'table;
                }
                let page = Pte::from_raw(self.phys.read_u64_at(pages + idx * 8));
                if !page.present() {
                    continue 'table;
                }
                self.shm.swap_attempts += 1;
                counter -= 1;
                if counter < 0 {
                    self.swap.swap_free(swap_nr);
                    flush.commit(&mut self.tlb);
                    return false;
                }

                let frame = page.page();
                // Pin: the reference check below must not race the frame
                // away while attacher PTEs are being rewritten.
                self.phys.inc_ref(frame);

                // Walk every attacher and retract its mapping.
                let attachers = self.collect_attachers(slot);
                for att in attachers {
                    if sig_id(att.code) != slot {
                        log::error!(
                            "[SHM] swap: slot {} does not match attach signature {}",
                            slot,
                            sig_id(att.code)
                        );
                        continue;
                    }
                    let tmp = att.start + ((idx as u64) << PAGE_SHIFT) - att.offset;
                    if tmp < att.start || tmp >= att.end {
                        continue;
                    }
                    let Some(root) = self.tasks.get(att.task).map(|t| t.root) else {
                        continue;
                    };
                    let Some(slot_ref) = paging::walk(&self.phys, root, tmp) else {
                        log::error!("[SHM] swap: bad page table for attach at {:#x}", tmp);
                        continue;
                    };
                    let pte = slot_ref.get(&self.phys);
                    if !pte.present() {
                        continue;
                    }
                    if pte.young() {
                        // Second chance: age it and move on.
                        slot_ref.set(&mut self.phys, pte.mkold());
                        continue;
                    }
                    if pte.page() != frame {
                        log::error!("[SHM] swap: page and pte mismatch");
                    }
                    slot_ref.set(
                        &mut self.phys,
                        Pte::from_raw(att.code | ((idx as u64) << SHM_IDX_SHIFT)),
                    );
                    self.phys.free(frame, 0);
                    if let Some(task) = self.tasks.get_mut(att.task) {
                        if task.rss > 0 {
                            task.rss -= 1;
                        }
                        flush.all(att.task);
                    }
                }

                // Segment ref + our pin and nothing else: the page is cold
                // everywhere and can go out.
                if self.phys.ref_count(frame) != 2 {
                    self.phys.free(frame, 0);
                    continue 'table;
                }
                {
                    let MemorySystem { phys, swap, .. } = self;
                    swap.write_swap_page(swap_nr, frame, phys);
                }
                self.phys.write_u64_at(pages + idx * 8, swap_nr);
                self.phys.free(frame, 0); // unpin
                self.phys.free(frame, 0); // segment reference: frame is free
                self.shm.swap_successes += 1;
                self.shm.shm_swp += 1;
                self.shm.shm_rss -= 1;
                flush.commit(&mut self.tlb);
                log::debug!("[SHM] swapped out slot {} page {} to {:#x}", slot, idx, swap_nr);
                return true;
            }
        }
    }

    fn collect_attachers(&self, slot: usize) -> Vec<Attacher> {
        let mut out = Vec::new();
        let Some(seg) = self.shm.seg(slot) else { return out };
        let Some(head) = seg.attaches else { return out };
        let mut cur = head;
        loop {
            let v = self.vmas.get(cur);
            if let VmaBacking::SharedSeg { signature } = v.backing {
                out.push(Attacher {
                    code: signature,
                    start: v.start,
                    end: v.end,
                    offset: v.offset,
                    task: v.task,
                });
            }
            match self.vmas.get(cur).share_next {
                Some(next) if next != head => cur = next,
                _ => break,
            }
        }
        out
    }

    /// Swap-in fault op for segment attachments: decode the signature,
    /// consult the segment's page table, and hand back a full PTE. Other
    /// faulters may resolve the same page while the read sleeps, so the
    /// entry is re-checked after every suspension point.
    pub(crate) fn shm_swap_in(&mut self, vma_id: VmaId, offset: u64, code: u64) -> Pte {
        let (vma_code, pid, page_prot) = {
            let v = self.vmas.get(vma_id);
            match v.backing {
                VmaBacking::SharedSeg { signature } => (signature, v.task, v.page_prot),
                _ => return self.bad_page(),
            }
        };
        let slot = sig_id(code);
        if slot != sig_id(vma_code) {
            log::error!("[SHM] swap_in: code id {} and attach id {} differ", slot, sig_id(vma_code));
            return self.bad_page();
        }
        if slot > self.shm.max_shmid {
            log::error!("[SHM] swap_in: id {} too big, process memory corrupted", slot);
            return self.bad_page();
        }
        let (npages, pages) = match self.shm.seg(slot) {
            Some(seg) => (seg.npages, seg.pages),
            None => {
                log::error!("[SHM] swap_in: slot {} invalid, raced a kill", slot);
                return self.bad_page();
            }
        };
        let idx = sig_idx(code);
        if idx != (offset >> PAGE_SHIFT) as usize {
            log::error!("[SHM] swap_in: code idx {} and offset idx {} differ", idx, offset >> PAGE_SHIFT);
            return self.bad_page();
        }
        if idx >= npages {
            log::error!("[SHM] swap_in: page index {} out of range", idx);
            return self.bad_page();
        }

        let mut pte = Pte::from_raw(self.phys.read_u64_at(pages + idx * 8));
        if !pte.present() {
            let Some(page) = self.get_free_page(gfp::GFP_KERNEL) else {
                self.oom(pid);
                return self.bad_page();
            };
            pte = Pte::from_raw(self.phys.read_u64_at(pages + idx * 8));
            if pte.present() {
                // Another faulter beat us to it while allocating.
                self.phys.free(page, 0);
            } else {
                if !pte.none() {
                    {
                        let MemorySystem { phys, swap, .. } = self;
                        swap.read_swap_page(pte.raw(), page, phys);
                    }
                    let reread = Pte::from_raw(self.phys.read_u64_at(pages + idx * 8));
                    if reread.present() {
                        self.phys.free(page, 0);
                        pte = reread;
                        return self.shm_swap_in_done(pid, page_prot, pte);
                    }
                    self.swap.swap_free(pte.raw());
                    self.shm.shm_swp -= 1;
                }
                self.shm.shm_rss += 1;
                pte = Pte::mk_pte(page, paging::prot::PAGE_SHARED).mkdirty();
                self.phys.write_u64_at(pages + idx * 8, pte.raw());
            }
        } else if let Some(task) = self.tasks.get_mut(pid) {
            // do_swap_page will count a major fault; this one never hit
            // the device.
            task.maj_flt = task.maj_flt.saturating_sub(1);
        }
        self.shm_swap_in_done(pid, page_prot, pte)
    }

    fn shm_swap_in_done(&mut self, pid: Pid, page_prot: u64, pte: Pte) -> Pte {
        if let Some(task) = self.tasks.get_mut(pid) {
            task.min_flt += 1;
        }
        self.phys.inc_ref(pte.page());
        pte.modify(page_prot)
    }
}

/// Per-attacher snapshot used by the eviction scan.
struct Attacher {
    code: u64,
    start: u64,
    end: u64,
    offset: u64,
    task: Pid,
}

/// shmctl buffer argument: which variant a command reads or fills.
pub enum ShmCtl<'a> {
    None,
    Stat(&'a mut ShmidDs),
    Set(&'a ShmidDs),
    Info(&'a mut ShmInfo),
    Limits(&'a mut ShmLimits),
}

/// IPC_STAT / SHM_STAT result.
#[derive(Clone, Debug, Default)]
pub struct ShmidDs {
    pub perm: PermView,
    pub segsz: usize,
    pub atime: u64,
    pub dtime: u64,
    pub ctime: u64,
    pub cpid: Pid,
    pub lpid: Pid,
    pub nattch: i32,
}

/// The caller-visible slice of an IpcPerm.
#[derive(Clone, Debug, Default)]
pub struct PermView {
    pub key: Key,
    pub uid: u16,
    pub gid: u16,
    pub mode: u16,
}

fn stat_of(seg: &ShmSegment) -> ShmidDs {
    ShmidDs {
        perm: PermView { key: seg.perm.key, uid: seg.perm.uid, gid: seg.perm.gid, mode: seg.perm.mode },
        segsz: seg.segsz,
        atime: seg.atime,
        dtime: seg.dtime,
        ctime: seg.ctime,
        cpid: seg.cpid,
        lpid: seg.lpid,
        nattch: seg.nattch,
    }
}

/// SHM_INFO result: global usage counters.
#[derive(Clone, Debug, Default)]
pub struct ShmInfo {
    pub used_ids: usize,
    pub shm_tot: usize,
    pub shm_rss: usize,
    pub shm_swp: usize,
    pub swap_attempts: u64,
    pub swap_successes: u64,
}

/// IPC_INFO result: compiled-in limits.
#[derive(Clone, Debug, Default)]
pub struct ShmLimits {
    pub shmmni: usize,
    pub shmmax: usize,
    pub shmmin: usize,
    pub shmall: usize,
    pub shmseg: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySystem, PAGE_SIZE};

    fn setup_two() -> (MemorySystem, Pid, Pid) {
        let mut ms = MemorySystem::new_default();
        let p1 = ms.create_task("p1").unwrap();
        let p2 = ms.create_task("p2").unwrap();
        (ms, p1, p2)
    }

    fn attach(ms: &mut MemorySystem, pid: Pid, id: i64, flg: u32) -> u64 {
        let mut raddr = 0;
        assert_eq!(ms.sys_shmat(pid, id, 0, flg, &mut raddr), 0);
        raddr
    }

    #[test]
    fn get_create_and_lookup_share_an_id() {
        let (mut ms, p1, p2) = setup_two();
        let id = ms.sys_shmget(p1, 7, 3 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        assert!(id >= 0);
        assert_eq!(ms.sys_shmget(p2, 7, 0, 0o666), id);
        // CREATE+EXCL on the existing key refuses
        assert_eq!(
            ms.sys_shmget(p2, 7, PAGE_SIZE, (IPC_CREAT | IPC_EXCL) as u32 | 0o666),
            crate::syscall::errno::EEXIST
        );
        // unknown key without CREATE
        assert_eq!(ms.sys_shmget(p2, 8, PAGE_SIZE, 0o666), crate::syscall::errno::ENOENT);
        // oversized request
        assert_eq!(
            ms.sys_shmget(p2, 9, SHMMAX + 1, IPC_CREAT as u32 | 0o666),
            crate::syscall::errno::EINVAL
        );
    }

    #[test]
    fn writes_through_one_attach_are_visible_through_the_other() {
        let (mut ms, p1, p2) = setup_two();
        let id = ms.sys_shmget(p1, 7, 3 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let v1 = attach(&mut ms, p1, id, 0);
        let v2 = attach(&mut ms, p2, id, 0);
        assert_eq!(v1 % SHMLBA, 0);
        assert_eq!(v2 % SHMLBA, 0);

        ms.write_user(p1, v1 + 100, b"hello from p1").unwrap();
        let mut buf = [0u8; 13];
        ms.read_user(p2, v2 + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello from p1");

        // One frame backs both attaches plus the segment table.
        let r1 = ms.tasks.get(p1).unwrap().root;
        let r2 = ms.tasks.get(p2).unwrap().root;
        let f1 = crate::memory::paging::follow(&ms.phys, r1, v1 + 100).unwrap().0;
        let f2 = crate::memory::paging::follow(&ms.phys, r2, v2 + 100).unwrap().0;
        assert_eq!(f1, f2);
        assert_eq!(ms.phys.ref_count(f1), 3);
        assert_eq!(ms.shm.shm_rss, 1);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn attach_placement_respects_hints_and_alignment() {
        let (mut ms, p1, _) = setup_two();
        let id = ms.sys_shmget(p1, 7, 2 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let mut raddr = 0;
        // misaligned hint without ROUND
        assert_eq!(
            ms.sys_shmat(p1, id, crate::memory::MMAP_BASE + 0x123, 0, &mut raddr),
            crate::syscall::errno::EINVAL
        );
        // misaligned hint with ROUND rounds down
        assert_eq!(
            ms.sys_shmat(p1, id, crate::memory::MMAP_BASE + SHMLBA + 0x123, SHM_RND, &mut raddr),
            0
        );
        assert_eq!(raddr, crate::memory::MMAP_BASE + SHMLBA);
        // the same range again without REMAP intersects
        assert_eq!(
            ms.sys_shmat(p1, id, raddr, 0, &mut raddr),
            crate::syscall::errno::EINVAL
        );
        // REMAP replaces the old attach in place
        let mut again = 0;
        assert_eq!(
            ms.sys_shmat(p1, id, raddr, SHM_REMAP, &mut again),
            0
        );
        assert_eq!(again, raddr);
        // a hint inside the stack guard band is refused
        let stack = ms.tasks.get(p1).unwrap().start_stack;
        let near_stack = stack - SHMLBA;
        assert_eq!(
            ms.sys_shmat(p1, id, near_stack, 0, &mut raddr),
            crate::syscall::errno::EINVAL
        );
    }

    #[test]
    fn detach_restores_the_prior_mapping_set() {
        let (mut ms, p1, _) = setup_two();
        let id = ms.sys_shmget(p1, 7, 2 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let before = ms.tasks.get(p1).unwrap().vmas.clone();
        let v = attach(&mut ms, p1, id, 0);
        ms.write_user(p1, v, b"transient").unwrap();
        assert_eq!(ms.sys_shmdt(p1, v), 0);
        assert_eq!(ms.tasks.get(p1).unwrap().vmas, before);
        assert_eq!(ms.shm.seg(id as usize % SHMMNI).unwrap().nattch, 0);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn swap_out_second_chance_then_eviction_and_reload() {
        let (mut ms, p1, p2) = setup_two();
        let id = ms.sys_shmget(p1, 7, 3 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let v1 = attach(&mut ms, p1, id, 0);
        let v2 = attach(&mut ms, p2, id, 0);
        for i in 0..3u64 {
            ms.write_user(p1, v1 + i * PAGE_SIZE as u64, b"persistent page").unwrap();
            let mut buf = [0u8; 4];
            ms.read_user(p2, v2 + i * PAGE_SIZE as u64, &mut buf).unwrap();
        }
        assert_eq!(ms.shm.shm_rss, 3);
        let rss_before = ms.tasks.get(p1).unwrap().rss;

        // First pass only ages the young pages.
        assert!(!ms.shm_swap(0));
        assert_eq!(ms.shm.shm_rss, 3);
        // Second pass evicts one cold page.
        assert!(ms.shm_swap(0));
        assert_eq!(ms.shm.shm_rss, 2);
        assert_eq!(ms.shm.shm_swp, 1);
        assert_eq!(ms.tasks.get(p1).unwrap().rss, rss_before - 1);

        // Find which page index the round-robin picked.
        let seg = ms.shm.seg(id as usize % SHMMNI).unwrap();
        let pages = seg.pages;
        let idx = (0..3)
            .find(|&i| {
                let e = Pte::from_raw(ms.phys.read_u64_at(pages + i * 8));
                !e.present() && !e.none()
            })
            .expect("no page went out");
        let entry = Pte::from_raw(ms.phys.read_u64_at(pages + idx * 8));
        assert_eq!(ms.swap.slot_refs(entry.raw()), 1);
        let off = (idx * PAGE_SIZE) as u64;

        // Both attachers dropped to the signature encoding.
        let r1 = ms.tasks.get(p1).unwrap().root;
        let r2 = ms.tasks.get(p2).unwrap().root;
        for (root, base) in [(r1, v1), (r2, v2)] {
            let pte = crate::memory::paging::walk(&ms.phys, root, base + off)
                .unwrap()
                .get(&ms.phys);
            assert!(!pte.present());
            assert_ne!(pte.raw(), 0);
        }

        // Touching it from either side reads the contents back in.
        let mut buf = [0u8; 15];
        ms.read_user(p2, v2 + off, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent page");
        assert_eq!(ms.shm.shm_swp, 0);
        assert_eq!(ms.shm.shm_rss, 3);
        ms.read_user(p1, v1 + off, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent page");
        let f1 = crate::memory::paging::follow(&ms.phys, r1, v1 + off).unwrap().0;
        assert_eq!(ms.phys.ref_count(f1), 3);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn private_segments_are_distinct_and_die_cleanly() {
        let (mut ms, p1, p2) = setup_two();
        let free0 = ms.phys.nr_free();
        let a = ms.sys_shmget(p1, IPC_PRIVATE, 2 * PAGE_SIZE, 0o600);
        let b = ms.sys_shmget(p1, IPC_PRIVATE, 2 * PAGE_SIZE, 0o600);
        assert!(a >= 0 && b >= 0);
        assert_ne!(a as usize % SHMMNI, b as usize % SHMMNI);

        // rmid on the never-attached first segment kills it immediately.
        assert_eq!(ms.sys_shmctl(p1, a, IPC_RMID, ShmCtl::None), 0);
        assert!(ms.shm.seg(a as usize % SHMMNI).is_none());

        // the second keeps working across two attaches and an rmid
        let v1 = attach(&mut ms, p1, b, 0);
        let v2 = attach(&mut ms, p2, b, 0);
        ms.write_user(p1, v1, b"outliving rmid").unwrap();
        assert_eq!(ms.sys_shmctl(p1, b, IPC_RMID, ShmCtl::None), 0);
        let mut buf = [0u8; 14];
        ms.read_user(p2, v2, &mut buf).unwrap();
        assert_eq!(&buf, b"outliving rmid");

        // last detach destroys it and every resource comes home
        assert_eq!(ms.sys_shmdt(p1, v1), 0);
        assert_eq!(ms.sys_shmdt(p2, v2), 0);
        assert!(ms.shm.seg(b as usize % SHMMNI).is_none());
        assert_eq!(ms.shm.shm_rss, 0);
        assert_eq!(ms.shm.shm_tot, 0);
        assert_eq!(ms.swap.used_slots(), 0);
        // Only the page-table frames the attaches grew (one middle + one
        // leaf table per task) remain with their tasks.
        assert_eq!(ms.phys.nr_free(), free0 - 4);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn recycled_slots_reject_stale_ids() {
        let (mut ms, p1, _) = setup_two();
        let old = ms.sys_shmget(p1, 9, PAGE_SIZE, IPC_CREAT as u32 | 0o600);
        assert_eq!(ms.sys_shmctl(p1, old, IPC_RMID, ShmCtl::None), 0);
        // Same key lands in the same slot with a bumped generation.
        let fresh = ms.sys_shmget(p1, 9, PAGE_SIZE, IPC_CREAT as u32 | 0o600);
        assert_eq!(old as usize % SHMMNI, fresh as usize % SHMMNI);
        assert_ne!(old, fresh);
        let mut raddr = 0;
        assert_eq!(ms.sys_shmat(p1, old, 0, 0, &mut raddr), crate::syscall::errno::EIDRM);
        assert_eq!(
            ms.sys_shmctl(p1, old, IPC_RMID, ShmCtl::None),
            crate::syscall::errno::EIDRM
        );
    }

    #[test]
    fn destroyed_segments_refuse_new_getters() {
        let (mut ms, p1, p2) = setup_two();
        let id = ms.sys_shmget(p1, 11, PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let v = attach(&mut ms, p1, id, 0);
        assert_eq!(ms.sys_shmctl(p1, id, IPC_RMID, ShmCtl::None), 0);
        // still attached, so the segment lives but the key is dead
        assert_eq!(ms.sys_shmget(p2, 11, PAGE_SIZE, 0o666), crate::syscall::errno::EIDRM);
        assert_eq!(ms.sys_shmdt(p1, v), 0);
        assert!(ms.shm.seg(id as usize % SHMMNI).is_none());
    }

    #[test]
    fn fork_carries_attaches_into_the_child() {
        let (mut ms, p1, _) = setup_two();
        let id = ms.sys_shmget(p1, 13, 2 * PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let v = attach(&mut ms, p1, id, 0);
        ms.write_user(p1, v, b"inherited").unwrap();
        let child = ms.fork_task(p1, "child", false).unwrap();
        assert_eq!(ms.shm.seg(id as usize % SHMMNI).unwrap().nattch, 2);

        let mut buf = [0u8; 9];
        ms.read_user(child, v, &mut buf).unwrap();
        assert_eq!(&buf, b"inherited");
        // writes through the child stay shared, not COW'd
        ms.write_user(child, v, b"two-way!!").unwrap();
        ms.read_user(p1, v, &mut buf).unwrap();
        assert_eq!(&buf, b"two-way!!");

        ms.exit_mm(child);
        assert_eq!(ms.shm.seg(id as usize % SHMMNI).unwrap().nattch, 1);
        assert_eq!(ms.verify_frame_refcounts(), 0);
    }

    #[test]
    fn ctl_reports_stats_and_limits() {
        let (mut ms, p1, _) = setup_two();
        let id = ms.sys_shmget(p1, 17, 3 * PAGE_SIZE, IPC_CREAT as u32 | 0o640);
        let v = attach(&mut ms, p1, id, 0);
        ms.write_user(p1, v, b"x").unwrap();

        let mut ds = ShmidDs::default();
        assert_eq!(ms.sys_shmctl(p1, id, IPC_STAT, ShmCtl::Stat(&mut ds)), 0);
        assert_eq!(ds.segsz, 3 * PAGE_SIZE);
        assert_eq!(ds.nattch, 1);
        assert_eq!(ds.perm.key, 17);
        assert_eq!(ds.perm.mode & 0o777, 0o640);

        let mut info = ShmInfo::default();
        assert!(ms.sys_shmctl(p1, id, SHM_INFO, ShmCtl::Info(&mut info)) >= 0);
        assert_eq!(info.shm_rss, 1);
        assert_eq!(info.shm_tot, 3);

        let mut limits = ShmLimits::default();
        assert!(ms.sys_shmctl(p1, id, IPC_INFO, ShmCtl::Limits(&mut limits)) >= 0);
        assert_eq!(limits.shmmni, SHMMNI);
        assert_eq!(limits.shmmax, SHMMAX);

        // IPC_SET swaps the permission bits, nothing else
        let mut new_ds = ShmidDs::default();
        new_ds.perm.uid = 5;
        new_ds.perm.mode = 0o600;
        assert_eq!(ms.sys_shmctl(p1, id, IPC_SET, ShmCtl::Set(&new_ds)), 0);
        let seg = ms.shm.seg(id as usize % SHMMNI).unwrap();
        assert_eq!(seg.perm.uid, 5);
        assert_eq!(seg.perm.mode & 0o777, 0o600);
    }

    #[test]
    fn locked_segments_are_skipped_by_the_swapper() {
        let (mut ms, p1, _) = setup_two();
        let id = ms.sys_shmget(p1, 19, PAGE_SIZE, IPC_CREAT as u32 | 0o666);
        let v = attach(&mut ms, p1, id, 0);
        ms.write_user(p1, v, b"pinned").unwrap();
        assert_eq!(ms.sys_shmctl(p1, id, SHM_LOCK, ShmCtl::None), 0);
        // age pass plus eviction pass: the locked segment never swaps
        assert!(!ms.shm_swap(0));
        assert!(!ms.shm_swap(0));
        assert_eq!(ms.shm.shm_swp, 0);
        assert_eq!(ms.sys_shmctl(p1, id, SHM_UNLOCK, ShmCtl::None), 0);
        assert!(!ms.shm_swap(0)); // ages
        assert!(ms.shm_swap(0)); // evicts
        assert_eq!(ms.shm.shm_swp, 1);
    }

    #[test]
    fn permissions_gate_get_and_attach() {
        let (mut ms, p1, p2) = setup_two();
        {
            let t1 = ms.tasks.get_mut(p1).unwrap();
            t1.euid = 100;
        }
        {
            let t2 = ms.tasks.get_mut(p2).unwrap();
            t2.euid = 200;
        }
        let id = ms.sys_shmget(p1, 23, PAGE_SIZE, IPC_CREAT as u32 | 0o600);
        assert!(id >= 0);
        assert_eq!(ms.sys_shmget(p2, 23, PAGE_SIZE, 0o600), crate::syscall::errno::EACCES);
        let mut raddr = 0;
        assert_eq!(ms.sys_shmat(p2, id, 0, 0, &mut raddr), crate::syscall::errno::EACCES);
        assert_eq!(
            ms.sys_shmctl(p2, id, IPC_RMID, ShmCtl::None),
            crate::syscall::errno::EPERM
        );
    }
}
