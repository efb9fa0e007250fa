//! Memory management subsystem
//!
//! Everything physical lives behind one handle: the frame allocator and
//! its arena, the pooled kalloc allocator, swap, the VMA registry, the
//! shared-segment directory, and the task table. The handle is injectable
//! so the core runs hosted; a singleton accessor for the running kernel
//! lives in `syscall`.

pub mod frame;
pub mod kalloc;
pub mod paging;
pub mod swap;
pub mod vma;
pub mod cow;
pub mod fault;
pub mod mprotect;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::ipc::shm::ShmDirectory;
use crate::process::{send_sig, Pid, Task, TaskTable, PID_BOOT, SIGKILL};

use frame::{gfp, FrameAllocator, FrameNo};
use kalloc::KallocPool;
use paging::{Pte, TlbTracker};
use swap::{MemSwapDevice, SwapDevice, SwapManager};
use vma::{FileTable, VmaPool};

/// Page / frame size
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Top-level directory slots covering user space; the rest are kernel
pub const USER_PTRS_PER_PGD: usize = 256;

/// Where anonymous placement searches start (shm attach, future mmap)
pub const MMAP_BASE: u64 = 0x10_0000_0000;

/// Default top of a task's stack region
pub const DEFAULT_STACK_TOP: u64 = 0x3e_0000_0000;

/// Unmapped band kept below the stack top
pub const STACK_GUARD: u64 = 16384;

/// Frames 0..RESERVED_LOW stand in for boot code/data and are RESERVED
const RESERVED_LOW: usize = 16;

/// Internal error kinds; the syscall boundary maps them onto errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    InvalidArg,
    NotFound,
    /// Stale segment id (`seq` mismatch) or removed segment
    Deleted,
    Exists,
    NoSpace,
    NoMemory,
    PermissionDenied,
    BadAddress,
    /// Interruptible sleep cut short by a signal
    Interrupted,
    /// Structural corruption detected; the operation was aborted
    Corrupted,
}

impl KernelError {
    pub fn errno(self) -> i64 {
        use crate::syscall::errno::*;
        match self {
            KernelError::InvalidArg => EINVAL,
            KernelError::NotFound => ENOENT,
            KernelError::Deleted => EIDRM,
            KernelError::Exists => EEXIST,
            KernelError::NoSpace => ENOSPC,
            KernelError::NoMemory => ENOMEM,
            KernelError::PermissionDenied => EACCES,
            KernelError::BadAddress => EFAULT,
            KernelError::Interrupted => EINTR,
            KernelError::Corrupted => EFAULT,
        }
    }
}

/// Boot-time knobs. Defaults give a 4 MB machine with a 1 MB DMA window
/// and a 1 MB swap area.
pub struct MemoryConfig {
    pub frames: usize,
    pub dma_frames: usize,
    pub swap_slots: usize,
    pub swap_device: Option<Box<dyn SwapDevice>>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { frames: 1024, dma_frames: 256, swap_slots: 256, swap_device: None }
    }
}

/// The kernel memory subsystem.
pub struct MemorySystem {
    pub phys: FrameAllocator,
    pub swap: SwapManager,
    pub kalloc: KallocPool,
    pub vmas: VmaPool,
    pub files: FileTable,
    pub shm: ShmDirectory,
    pub tasks: TaskTable,
    pub tlb: TlbTracker,
    /// Shared zero page (RESERVED)
    pub zero_frame: FrameNo,
    /// Landing frame for the BAD_PAGE sentinel (RESERVED)
    pub bad_frame: FrameNo,
    /// The boot task's top-level directory; never torn down
    pub boot_root: FrameNo,
    /// Interrupt nesting depth of the current context
    pub intr_count: u32,
}

impl MemorySystem {
    pub fn new(config: MemoryConfig) -> Self {
        crate::logger::init();
        let mut phys = FrameAllocator::new(config.frames, config.dma_frames, RESERVED_LOW);
        let device = config.swap_device.unwrap_or_else(|| Box::new(MemSwapDevice::new()));
        let swap = SwapManager::new(config.swap_slots, device);

        // Fixed service frames inside the reserved band.
        let zero_frame = 1;
        let bad_frame = 2;

        // Boot directory plus the kernel-shared tables mapping the
        // reserved band high. The tables are RESERVED themselves so the
        // teardown walkers copy entries verbatim and never recurse.
        let boot_root = phys.alloc(0, gfp::GFP_KERNEL).expect("boot: no frame for root directory");
        phys.zero_page(boot_root);
        let kernel_pmd = phys.alloc(0, gfp::GFP_KERNEL).expect("boot: no frame for kernel pmd");
        let kernel_pte = phys.alloc(0, gfp::GFP_KERNEL).expect("boot: no frame for kernel pte");
        phys.zero_page(kernel_pmd);
        phys.zero_page(kernel_pte);
        phys.write_word(boot_root, USER_PTRS_PER_PGD, paging::mk_table_entry(kernel_pmd).raw());
        phys.write_word(kernel_pmd, 0, paging::mk_table_entry(kernel_pte).raw());
        for f in 0..RESERVED_LOW {
            phys.write_word(kernel_pte, f, Pte::mk_pte(f, paging::prot::PAGE_KERNEL).raw());
        }
        phys.set_reserved(kernel_pmd);
        phys.set_reserved(kernel_pte);

        let mut tasks = TaskTable::new();
        tasks.insert_boot(Task::new(PID_BOOT, "swapper", boot_root));

        log::info!("[MEM] core up: {} frames, boot root at frame {}", config.frames, boot_root);
        Self {
            phys,
            swap,
            kalloc: KallocPool::new(),
            vmas: VmaPool::new(),
            files: FileTable::new(),
            shm: ShmDirectory::new(),
            tasks,
            tlb: TlbTracker::new(),
            zero_frame,
            bad_frame,
            boot_root,
            intr_count: 0,
        }
    }

    pub fn new_default() -> Self {
        Self::new(MemoryConfig::default())
    }

    // --- interrupt context tracking ---

    pub fn enter_interrupt(&mut self) {
        self.intr_count += 1;
    }

    pub fn leave_interrupt(&mut self) {
        self.intr_count = self.intr_count.saturating_sub(1);
    }

    pub fn in_interrupt(&self) -> bool {
        self.intr_count > 0
    }

    // --- frames ---

    /// Allocate one zeroed frame. Non-ATOMIC callers ride out memory
    /// pressure by pushing shared-segment pages to swap between attempts
    /// (the single-CPU analogue of sleeping for memory).
    pub fn get_free_page(&mut self, flags: u32) -> Option<FrameNo> {
        let may_reclaim =
            flags & gfp::GFP_LEVEL_MASK != gfp::GFP_ATOMIC && !self.in_interrupt();
        let mut tries = 6;
        loop {
            let got = if flags & gfp::GFP_DMA != 0 {
                self.phys.alloc_dma(0, flags)
            } else {
                self.phys.alloc(0, flags)
            };
            if let Some(f) = got {
                self.phys.zero_page(f);
                return Some(f);
            }
            if !may_reclaim || tries == 0 {
                return None;
            }
            tries -= 1;
            if !self.shm_swap(0) {
                return None;
            }
        }
    }

    /// Drop one reference to a frame.
    pub fn free_page(&mut self, frame: FrameNo) {
        swap::free_page_and_swap_cache(&mut self.phys, &mut self.swap, frame);
    }

    /// Out-of-memory: diagnose and kill. The process dies with an
    /// untrappable signal rather than the kernel panicking.
    pub fn oom(&mut self, pid: Pid) {
        if let Some(task) = self.tasks.get_mut(pid) {
            log::error!("[MEM] out of memory for {} (pid {})", task.name, pid);
            send_sig(SIGKILL, task);
        }
    }

    // --- pooled allocator ---

    pub fn kalloc(&mut self, size: usize, priority: u32) -> Result<usize, KernelError> {
        let in_irq = self.intr_count > 0;
        let MemorySystem { phys, kalloc, .. } = self;
        kalloc.kalloc(phys, size, priority, in_irq)
    }

    pub fn kfree(&mut self, ptr: usize, size: usize) {
        let MemorySystem { phys, kalloc, .. } = self;
        kalloc.kfree(phys, ptr, size);
    }

    // --- tasks ---

    /// Fresh top-level directory sharing the kernel slots of the boot
    /// directory.
    pub fn create_root(&mut self) -> Result<FrameNo, KernelError> {
        let root = self.phys.alloc(0, gfp::GFP_KERNEL).ok_or(KernelError::NoMemory)?;
        self.phys.zero_page(root);
        for i in USER_PTRS_PER_PGD..paging::ENTRIES_PER_TABLE {
            let entry = self.phys.read_word(self.boot_root, i);
            self.phys.write_word(root, i, entry);
        }
        Ok(root)
    }

    /// Create an empty task with its own directory.
    pub fn create_task(&mut self, name: &str) -> Result<Pid, KernelError> {
        let root = self.create_root()?;
        Ok(self.tasks.spawn(name, root))
    }

    /// Fork `parent`. `share_tables` picks the thread-like flavor that
    /// shares the whole top-level directory; otherwise the child gets a
    /// copy-on-write duplicate of the parent's address space.
    pub fn fork_task(&mut self, parent: Pid, name: &str, share_tables: bool) -> Result<Pid, KernelError> {
        let parent_vmas: Vec<vma::VmaId> = self
            .tasks
            .get(parent)
            .ok_or(KernelError::InvalidArg)?
            .vmas
            .clone();
        let parent_stack = self.tasks.get(parent).map(|p| p.start_stack).unwrap_or(DEFAULT_STACK_TOP);
        let child = if share_tables {
            let root = self.tasks.get(parent).unwrap().root;
            self.phys.inc_ref(root);
            self.tasks.spawn(name, root)
        } else {
            let root = self.phys.alloc(0, gfp::GFP_KERNEL).ok_or(KernelError::NoMemory)?;
            self.phys.zero_page(root);
            self.tasks.spawn(name, root)
        };
        if let Some(t) = self.tasks.get_mut(child) {
            t.start_stack = parent_stack;
        }

        // Duplicate the mappings; open ops keep files and segments counted.
        for id in parent_vmas {
            let mut copy = self.vmas.get(id).clone();
            copy.share_next = None;
            copy.share_prev = None;
            copy.task = child;
            let new_id = self.vmas.alloc(copy);
            self.vma_open(new_id);
            let MemorySystem { vmas, files, tasks, .. } = self;
            let task = tasks.get_mut(child).unwrap();
            vma::insert_vm_struct(vmas, files, task, new_id);
        }

        if !share_tables {
            if let Err(e) = self.copy_page_tables(parent, child) {
                self.exit_mm(child);
                return Err(e);
            }
        }
        Ok(child)
    }

    /// Tear down a task's address space and record (exit path).
    pub fn exit_mm(&mut self, pid: Pid) {
        let ids: Vec<vma::VmaId> = match self.tasks.get(pid) {
            Some(t) => t.vmas.clone(),
            None => return,
        };
        for id in ids {
            let (start, size) = {
                let v = self.vmas.get(id);
                (v.start, v.size())
            };
            self.tasks.get_mut(pid).unwrap().vmas.retain(|&x| x != id);
            self.vma_close(id);
            let MemorySystem { phys, swap, tlb, tasks, .. } = self;
            let task = tasks.get_mut(pid).unwrap();
            paging::unmap_page_range(phys, swap, tlb, task, start, size);
            self.vmas.remove(id);
        }
        let had_own_root = self.tasks.get(pid).map(|t| t.root != self.boot_root).unwrap_or(false);
        if had_own_root {
            self.free_page_tables(pid);
        }
        self.tasks.remove(pid);
        if had_own_root {
            // free_page_tables parked the task on the boot directory with
            // its own reference; the task record is gone now, so drop it.
            let boot_root = self.boot_root;
            self.phys.free(boot_root, 0);
        }
    }

    // --- statistics and invariants ---

    pub fn stats(&self) -> MemoryStats {
        let (frames_total, frames_free) = self.phys.stats();
        MemoryStats {
            frames_total,
            frames_free,
            swap: self.swap.stats(),
            vmas_live: self.vmas.live(),
            tasks: self.tasks.len(),
            shm_rss: self.shm.shm_rss,
            shm_swp: self.shm.shm_swp,
        }
    }

    /// Cross-engine refcount audit: for every frame reachable from a page
    /// table, the swap cache, or a segment page table, `mem_map` must
    /// equal the number of references found. Returns violations.
    pub fn verify_frame_refcounts(&self) -> usize {
        let mut expected: BTreeMap<FrameNo, u32> = BTreeMap::new();
        let mut visited_tables: Vec<FrameNo> = Vec::new();

        for pid in self.tasks.pids() {
            let root = self.tasks.get(pid).unwrap().root;
            *expected.entry(root).or_insert(0) += 1;
        }
        let mut roots: Vec<FrameNo> =
            self.tasks.pids().iter().map(|&p| self.tasks.get(p).unwrap().root).collect();
        roots.sort_unstable();
        roots.dedup();

        for root in roots {
            for i in 0..paging::ENTRIES_PER_TABLE {
                let pgd = Pte::from_raw(self.phys.read_word(root, i));
                if !pgd.present() || self.phys.is_reserved(pgd.page()) {
                    continue;
                }
                let pmd_table = pgd.page();
                *expected.entry(pmd_table).or_insert(0) += 1;
                if visited_tables.contains(&pmd_table) {
                    continue;
                }
                visited_tables.push(pmd_table);
                for j in 0..paging::ENTRIES_PER_TABLE {
                    let pmd = Pte::from_raw(self.phys.read_word(pmd_table, j));
                    if !pmd.present() || self.phys.is_reserved(pmd.page()) {
                        continue;
                    }
                    let leaf = pmd.page();
                    *expected.entry(leaf).or_insert(0) += 1;
                    if visited_tables.contains(&leaf) {
                        continue;
                    }
                    visited_tables.push(leaf);
                    for k in 0..paging::ENTRIES_PER_TABLE {
                        let pte = Pte::from_raw(self.phys.read_word(leaf, k));
                        if pte.present()
                            && !self.phys.out_of_range(pte.page())
                            && !self.phys.is_reserved(pte.page())
                        {
                            *expected.entry(pte.page()).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        // Swap-cache and segment-table references.
        for (frame, n) in self.swap_cache_refs() {
            *expected.entry(frame).or_insert(0) += n;
        }
        for frame in self.shm.resident_frames(&self.phys) {
            *expected.entry(frame).or_insert(0) += 1;
        }

        let mut bad = 0;
        for (frame, want) in expected {
            let have = self.phys.ref_count(frame);
            if have != want {
                log::error!("[MEM] frame {}: mem_map {} but {} references found", frame, have, want);
                bad += 1;
            }
        }
        bad
    }

    fn swap_cache_refs(&self) -> Vec<(FrameNo, u32)> {
        let mut v = Vec::new();
        for f in 0..self.phys.total_frames() {
            if self.swap.in_swap_cache(f).is_some() {
                v.push((f, 1));
            }
        }
        v
    }
}

/// Snapshot of the subsystem's counters.
#[derive(Clone, Debug)]
pub struct MemoryStats {
    pub frames_total: usize,
    pub frames_free: usize,
    pub swap: swap::SwapStats,
    pub vmas_live: usize,
    pub tasks: usize,
    pub shm_rss: usize,
    pub shm_swp: usize,
}
