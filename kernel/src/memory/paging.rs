//! Paging: three-level page tables
//!
//! Page-table entries are machine words; tables are page-sized arrays of
//! them living in ordinary frames, so an intermediate table's `mem_map`
//! count is its sharing count. The split is 9 bits per level over 4 KB
//! pages: top (pgd), middle (pmd), leaf (pte), 512 GB of address space.
//!
//! Kernel-shared tables live in RESERVED frames; walkers copy their
//! directory entries verbatim and never recurse into them.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::frame::{FrameAllocator, FrameNo};
use super::swap::{free_page_and_swap_cache, SwapManager};
use super::{KernelError, PAGE_SHIFT, PAGE_SIZE};
use crate::process::{Pid, Task};

/// Entries per table at every level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Bits covered by one leaf table / one middle table
pub const PMD_SHIFT: u32 = 21;
pub const PGDIR_SHIFT: u32 = 30;
pub const PMD_SIZE: u64 = 1 << PMD_SHIFT;
pub const PGDIR_SIZE: u64 = 1 << PGDIR_SHIFT;

/// First kernel address; everything below is user space
pub const TASK_SIZE: u64 = (super::USER_PTRS_PER_PGD as u64) << PGDIR_SHIFT;

// PTE flag bits
pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_ACCESSED: u64 = 1 << 5;
pub const PTE_DIRTY: u64 = 1 << 6;

/// Frame number field
const PTE_ADDR_MASK: u64 = !0xfff;

/// Bits preserved across a protection change
const PTE_CHG_MASK: u64 = PTE_ADDR_MASK | PTE_ACCESSED | PTE_DIRTY;

/// Page-protection templates
pub mod prot {
    use super::*;

    pub const PAGE_NONE: u64 = PTE_PRESENT | PTE_ACCESSED;
    pub const PAGE_SHARED: u64 = PTE_PRESENT | PTE_RW | PTE_USER | PTE_ACCESSED;
    pub const PAGE_COPY: u64 = PTE_PRESENT | PTE_USER | PTE_ACCESSED;
    pub const PAGE_READONLY: u64 = PTE_PRESENT | PTE_USER | PTE_ACCESSED;
    pub const PAGE_KERNEL: u64 = PTE_PRESENT | PTE_RW | PTE_DIRTY | PTE_ACCESSED;
}

/// Maps the low four VMA flag bits (read, write, exec, shared) to the PTE
/// template applied on fault. Bit 3 of the index is VM_SHARED: private
/// writable mappings fault in copy-on-write, shared writable mappings get
/// a writable template.
pub const PROTECTION_MAP: [u64; 16] = [
    // private: ---, r--, -w-, rw-, --x, r-x, -wx, rwx
    prot::PAGE_NONE,
    prot::PAGE_READONLY,
    prot::PAGE_COPY,
    prot::PAGE_COPY,
    prot::PAGE_READONLY,
    prot::PAGE_READONLY,
    prot::PAGE_COPY,
    prot::PAGE_COPY,
    // shared: ---, r--, -w-, rw-, --x, r-x, -wx, rwx
    prot::PAGE_NONE,
    prot::PAGE_READONLY,
    prot::PAGE_SHARED,
    prot::PAGE_SHARED,
    prot::PAGE_READONLY,
    prot::PAGE_READONLY,
    prot::PAGE_SHARED,
    prot::PAGE_SHARED,
];

/// A page-table entry value.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn none(self) -> bool {
        self.0 == 0
    }

    pub const fn present(self) -> bool {
        self.0 & PTE_PRESENT != 0
    }

    pub const fn write(self) -> bool {
        self.0 & PTE_RW != 0
    }

    pub const fn dirty(self) -> bool {
        self.0 & PTE_DIRTY != 0
    }

    pub const fn young(self) -> bool {
        self.0 & PTE_ACCESSED != 0
    }

    /// Frame number named by a present entry
    pub const fn page(self) -> FrameNo {
        ((self.0 & PTE_ADDR_MASK) >> PAGE_SHIFT) as FrameNo
    }

    pub const fn mk_pte(frame: FrameNo, prot: u64) -> Self {
        Self(((frame as u64) << PAGE_SHIFT) | prot)
    }

    /// Replace permission bits, keep frame/dirty/accessed
    pub const fn modify(self, prot: u64) -> Self {
        Self((self.0 & PTE_CHG_MASK) | (prot & !PTE_ADDR_MASK))
    }

    pub const fn wrprotect(self) -> Self {
        Self(self.0 & !PTE_RW)
    }

    pub const fn mkwrite(self) -> Self {
        Self(self.0 | PTE_RW)
    }

    pub const fn mkdirty(self) -> Self {
        Self(self.0 | PTE_DIRTY)
    }

    pub const fn mkold(self) -> Self {
        Self(self.0 & !PTE_ACCESSED)
    }

    pub const fn mkyoung(self) -> Self {
        Self(self.0 | PTE_ACCESSED)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x})", self.0)
    }
}

/// Directory entry naming a lower-level table frame.
pub fn mk_table_entry(table: FrameNo) -> Pte {
    Pte::mk_pte(table, PTE_PRESENT | PTE_RW | PTE_USER)
}

/// A located entry: which table frame, which slot. Reads and writes go
/// through the frame allocator's arena.
#[derive(Clone, Copy, Debug)]
pub struct PteRef {
    pub table: FrameNo,
    pub index: usize,
}

impl PteRef {
    pub fn get(&self, phys: &FrameAllocator) -> Pte {
        Pte::from_raw(phys.read_word(self.table, self.index))
    }

    pub fn set(&self, phys: &mut FrameAllocator, pte: Pte) {
        phys.write_word(self.table, self.index, pte.raw());
    }

    pub fn clear(&self, phys: &mut FrameAllocator) {
        self.set(phys, Pte::from_raw(0));
    }
}

pub fn pgd_index(addr: u64) -> usize {
    ((addr >> PGDIR_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}

pub fn pmd_index(addr: u64) -> usize {
    ((addr >> PMD_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}

pub fn pte_index(addr: u64) -> usize {
    ((addr >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}

pub fn pgd_ref(root: FrameNo, addr: u64) -> PteRef {
    PteRef { table: root, index: pgd_index(addr) }
}

/// A directory entry that is present but names an impossible table frame.
fn entry_bad(entry: Pte, phys: &FrameAllocator) -> bool {
    entry.present() && phys.out_of_range(entry.page())
}

/// Walk (without allocating) to the leaf entry covering `addr`.
pub fn walk(phys: &FrameAllocator, root: FrameNo, addr: u64) -> Option<PteRef> {
    let pgd = pgd_ref(root, addr).get(phys);
    if !pgd.present() || entry_bad(pgd, phys) {
        return None;
    }
    let pmd = PteRef { table: pgd.page(), index: pmd_index(addr) }.get(phys);
    if !pmd.present() || entry_bad(pmd, phys) {
        return None;
    }
    Some(PteRef { table: pmd.page(), index: pte_index(addr) })
}

/// Translate a user address to (frame, offset) if mapped.
pub fn follow(phys: &FrameAllocator, root: FrameNo, addr: u64) -> Option<(FrameNo, usize)> {
    let pte = walk(phys, root, addr)?.get(phys);
    if !pte.present() {
        return None;
    }
    Some((pte.page(), (addr & (PAGE_SIZE as u64 - 1)) as usize))
}

/// Get or create the middle table under `root` for `addr`. Returns its
/// frame.
pub fn pmd_alloc(phys: &mut FrameAllocator, root: FrameNo, addr: u64) -> Result<FrameNo, KernelError> {
    table_alloc(phys, PteRef { table: root, index: pgd_index(addr) })
}

/// Get or create the leaf table under the middle table for `addr`.
pub fn pte_alloc(phys: &mut FrameAllocator, pmd: FrameNo, addr: u64) -> Result<FrameNo, KernelError> {
    table_alloc(phys, PteRef { table: pmd, index: pmd_index(addr) })
}

fn table_alloc(phys: &mut FrameAllocator, slot: PteRef) -> Result<FrameNo, KernelError> {
    let entry = slot.get(phys);
    if entry.present() {
        if entry_bad(entry, phys) {
            log::error!("[PAGING] bad directory entry {:#x}", entry.raw());
            return Err(KernelError::Corrupted);
        }
        return Ok(entry.page());
    }
    if !entry.none() {
        log::error!("[PAGING] swapped directory entry {:#x}", entry.raw());
        return Err(KernelError::Corrupted);
    }
    let table = phys
        .alloc(0, super::frame::gfp::GFP_KERNEL)
        .ok_or(KernelError::NoMemory)?;
    phys.zero_page(table);
    slot.set(phys, mk_table_entry(table));
    Ok(table)
}

// --- TLB bookkeeping ---

/// One recorded invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlbEvent {
    Full(Pid),
    Page(Pid, u64),
}

/// Records invalidations for test observation; a port maps commits onto
/// the MMU. Bounded so a long-running kernel does not grow it.
pub struct TlbTracker {
    events: Vec<TlbEvent>,
    total: u64,
}

const TLB_LOG_MAX: usize = 4096;

impl TlbTracker {
    pub fn new() -> Self {
        Self { events: Vec::new(), total: 0 }
    }

    fn record(&mut self, ev: TlbEvent) {
        self.total += 1;
        if self.events.len() == TLB_LOG_MAX {
            self.events.remove(0);
        }
        self.events.push(ev);
    }

    pub fn events(&self) -> &[TlbEvent] {
        &self.events
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Invalidations recorded for a task (full or single-page).
    pub fn flushes_for(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, TlbEvent::Full(p) | TlbEvent::Page(p, _) if *p == pid))
            .count()
    }
}

/// Collects dirtied ranges across a multi-step page-table edit and commits
/// them as one batch. Dropping an uncommitted batch is a bug in debug
/// builds.
#[must_use = "an uncommitted flush leaves stale TLB entries"]
pub struct FlushBatch {
    pids_full: BTreeSet<Pid>,
    pages: Vec<(Pid, u64)>,
    committed: bool,
}

impl FlushBatch {
    pub fn new() -> Self {
        Self { pids_full: BTreeSet::new(), pages: Vec::new(), committed: false }
    }

    /// Queue a full flush for a task.
    pub fn all(&mut self, pid: Pid) {
        self.pids_full.insert(pid);
    }

    /// Queue a single-page flush.
    pub fn page(&mut self, pid: Pid, addr: u64) {
        self.pages.push((pid, addr & !(PAGE_SIZE as u64 - 1)));
    }

    pub fn commit(mut self, tlb: &mut TlbTracker) {
        self.committed = true;
        for pid in core::mem::take(&mut self.pids_full) {
            tlb.record(TlbEvent::Full(pid));
        }
        for (pid, addr) in core::mem::take(&mut self.pages) {
            tlb.record(TlbEvent::Page(pid, addr));
        }
    }
}

impl Drop for FlushBatch {
    fn drop(&mut self) {
        debug_assert!(
            self.committed || (self.pids_full.is_empty() && self.pages.is_empty()),
            "flush batch dropped uncommitted"
        );
    }
}

// --- dropping mappings ---

/// Release whatever a just-cleared PTE referenced: a present frame loses a
/// reference (and rss), a swapped one releases its slot.
pub fn forget_pte(phys: &mut FrameAllocator, swap: &mut SwapManager, task: &mut Task, pte: Pte) {
    if pte.none() {
        return;
    }
    if pte.present() {
        let frame = pte.page();
        if phys.out_of_range(frame) {
            return;
        }
        free_page_and_swap_cache(phys, swap, frame);
        if phys.is_reserved(frame) {
            return;
        }
        if task.rss > 0 {
            task.rss -= 1;
        }
        return;
    }
    swap.swap_free(pte.raw());
}

fn unmap_pte_range(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    task: &mut Task,
    pmd_entry: PteRef,
    address: u64,
    size: u64,
) {
    let entry = pmd_entry.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] unmap: bad pmd entry {:#x}", entry.raw());
        pmd_entry.clear(phys);
        return;
    }
    let table = entry.page();
    let mut offset = address & (PMD_SIZE - 1);
    let end = (offset + size).min(PMD_SIZE);
    while offset < end {
        let slot = PteRef { table, index: ((offset >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1) };
        let pte = slot.get(phys);
        slot.clear(phys);
        forget_pte(phys, swap, task, pte);
        offset += PAGE_SIZE as u64;
    }
}

fn unmap_pmd_range(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    task: &mut Task,
    pgd_entry: PteRef,
    address: u64,
    size: u64,
) {
    let entry = pgd_entry.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] unmap: bad pgd entry {:#x}", entry.raw());
        pgd_entry.clear(phys);
        return;
    }
    let table = entry.page();
    let mut offset = address & (PGDIR_SIZE - 1);
    let end = (offset + size).min(PGDIR_SIZE);
    while offset < end {
        let slot = PteRef { table, index: ((offset >> PMD_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1) };
        unmap_pte_range(phys, swap, task, slot, offset, end - offset);
        offset = (offset + PMD_SIZE) & !(PMD_SIZE - 1);
    }
}

/// Drop every mapping in [address, address+size). Frames lose a
/// reference, swap slots are released, the task's TLB is flushed.
pub fn unmap_page_range(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    tlb: &mut TlbTracker,
    task: &mut Task,
    address: u64,
    size: u64,
) {
    let end = address + size;
    let mut addr = address;
    while addr < end {
        unmap_pmd_range(phys, swap, task, pgd_ref(task.root, addr), addr, end - addr);
        addr = (addr + PGDIR_SIZE) & !(PGDIR_SIZE - 1);
        if addr == 0 {
            break;
        }
    }
    let mut flush = FlushBatch::new();
    flush.all(task.pid);
    flush.commit(tlb);
}

/// Map [address, address+size) to the shared zero page, write-protected.
/// Old mappings are dropped through the standard path.
pub fn zeromap_page_range(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    tlb: &mut TlbTracker,
    task: &mut Task,
    address: u64,
    size: u64,
    page_prot: u64,
    zero_frame: FrameNo,
) -> Result<(), KernelError> {
    let zero_pte = Pte::mk_pte(zero_frame, page_prot).wrprotect();
    let end = address + size;
    let mut addr = address;
    let result = loop {
        if addr >= end {
            break Ok(());
        }
        let pmd = match pmd_alloc(phys, task.root, addr) {
            Ok(t) => t,
            Err(e) => break Err(e),
        };
        let leaf = match pte_alloc(phys, pmd, addr) {
            Ok(t) => t,
            Err(e) => break Err(e),
        };
        let slot = PteRef { table: leaf, index: pte_index(addr) };
        let old = slot.get(phys);
        slot.set(phys, zero_pte);
        forget_pte(phys, swap, task, old);
        addr += PAGE_SIZE as u64;
    };
    let mut flush = FlushBatch::new();
    flush.all(task.pid);
    flush.commit(tlb);
    result
}

/// Force [from, from+size) to map the contiguous physical range starting
/// at frame `offset >> PAGE_SHIFT`. Reserved or out-of-range frames are
/// installed without reference counting (device windows); unknown free
/// frames become null mappings.
pub fn remap_page_range(
    phys: &mut FrameAllocator,
    swap: &mut SwapManager,
    tlb: &mut TlbTracker,
    task: &mut Task,
    from: u64,
    offset: u64,
    size: u64,
    page_prot: u64,
) -> Result<(), KernelError> {
    if (from | offset | size) & (PAGE_SIZE as u64 - 1) != 0 {
        return Err(KernelError::InvalidArg);
    }
    let end = from + size;
    let mut addr = from;
    let mut phys_addr = offset;
    let result = loop {
        if addr >= end {
            break Ok(());
        }
        let pmd = match pmd_alloc(phys, task.root, addr) {
            Ok(t) => t,
            Err(e) => break Err(e),
        };
        let leaf = match pte_alloc(phys, pmd, addr) {
            Ok(t) => t,
            Err(e) => break Err(e),
        };
        let slot = PteRef { table: leaf, index: pte_index(addr) };
        let old = slot.get(phys);
        slot.clear(phys);
        let frame = (phys_addr >> PAGE_SHIFT) as FrameNo;
        if phys.out_of_range(frame) || phys.is_reserved(frame) {
            slot.set(phys, Pte::mk_pte(frame, page_prot));
        } else if phys.ref_count(frame) != 0 {
            phys.inc_ref(frame);
            slot.set(phys, Pte::mk_pte(frame, page_prot));
        }
        forget_pte(phys, swap, task, old);
        addr += PAGE_SIZE as u64;
        phys_addr += PAGE_SIZE as u64;
    };
    let mut flush = FlushBatch::new();
    flush.all(task.pid);
    flush.commit(tlb);
    result
}

// --- protection walker ---

fn change_pte_range(
    phys: &mut FrameAllocator,
    pmd_entry: PteRef,
    address: u64,
    size: u64,
    newprot: u64,
) {
    let entry = pmd_entry.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] change_protection: bad pmd entry {:#x}", entry.raw());
        pmd_entry.clear(phys);
        return;
    }
    let table = entry.page();
    let mut offset = address & (PMD_SIZE - 1);
    let end = (offset + size).min(PMD_SIZE);
    while offset < end {
        let slot = PteRef { table, index: ((offset >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1) };
        let pte = slot.get(phys);
        if pte.present() {
            slot.set(phys, pte.modify(newprot));
        }
        offset += PAGE_SIZE as u64;
    }
}

fn change_pmd_range(
    phys: &mut FrameAllocator,
    pgd_entry: PteRef,
    address: u64,
    size: u64,
    newprot: u64,
) {
    let entry = pgd_entry.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] change_protection: bad pgd entry {:#x}", entry.raw());
        pgd_entry.clear(phys);
        return;
    }
    let table = entry.page();
    let mut offset = address & (PGDIR_SIZE - 1);
    let end = (offset + size).min(PGDIR_SIZE);
    while offset < end {
        let slot = PteRef { table, index: ((offset >> PMD_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1) };
        change_pte_range(phys, slot, offset, end - offset, newprot);
        offset = (offset + PMD_SIZE) & !(PMD_SIZE - 1);
    }
}

/// Rewrite the permission bits of every present PTE in [start, end) and
/// flush the task's TLB. Frames are untouched.
pub fn change_protection(
    phys: &mut FrameAllocator,
    tlb: &mut TlbTracker,
    task: &Task,
    start: u64,
    end: u64,
    newprot: u64,
) {
    let mut addr = start;
    while addr < end {
        change_pmd_range(phys, pgd_ref(task.root, addr), addr, end - addr, newprot);
        addr = (addr + PGDIR_SIZE) & !(PGDIR_SIZE - 1);
        if addr == 0 {
            break;
        }
    }
    let mut flush = FlushBatch::new();
    flush.all(task.pid);
    flush.commit(tlb);
}

// --- table teardown ---

fn free_one_pte(phys: &mut FrameAllocator, swap: &mut SwapManager, slot: PteRef) {
    let pte = slot.get(phys);
    if pte.none() {
        return;
    }
    slot.clear(phys);
    if !pte.present() {
        swap.swap_free(pte.raw());
        return;
    }
    free_page_and_swap_cache(phys, swap, pte.page());
}

fn free_one_pmd(phys: &mut FrameAllocator, swap: &mut SwapManager, slot: PteRef) {
    let entry = slot.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] free_one_pmd: bad entry {:#x}", entry.raw());
        slot.clear(phys);
        return;
    }
    let table = entry.page();
    slot.clear(phys);
    // Kernel-shared tables are reserved: drop the entry, keep the table.
    if phys.is_reserved(table) {
        return;
    }
    if phys.ref_count(table) > 1 {
        phys.free(table, 0);
        return;
    }
    for j in 0..ENTRIES_PER_TABLE {
        free_one_pte(phys, swap, PteRef { table, index: j });
    }
    phys.free(table, 0);
}

pub(super) fn free_one_pgd(phys: &mut FrameAllocator, swap: &mut SwapManager, slot: PteRef) {
    let entry = slot.get(phys);
    if entry.none() {
        return;
    }
    if entry_bad(entry, phys) {
        log::error!("[PAGING] free_one_pgd: bad entry {:#x}", entry.raw());
        slot.clear(phys);
        return;
    }
    let table = entry.page();
    slot.clear(phys);
    if phys.is_reserved(table) {
        return;
    }
    if phys.ref_count(table) > 1 {
        phys.free(table, 0);
        return;
    }
    for j in 0..ENTRIES_PER_TABLE {
        free_one_pmd(phys, swap, PteRef { table, index: j });
    }
    phys.free(table, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_encoding_round_trips() {
        let pte = Pte::mk_pte(42, prot::PAGE_SHARED);
        assert!(pte.present() && pte.write() && pte.young());
        assert_eq!(pte.page(), 42);
        let ro = pte.wrprotect();
        assert!(!ro.write());
        assert_eq!(ro.page(), 42);
        assert!(ro.mkdirty().dirty());
        assert!(!pte.mkold().young());
    }

    #[test]
    fn modify_keeps_frame_and_dirty() {
        let pte = Pte::mk_pte(7, prot::PAGE_SHARED).mkdirty();
        let ro = pte.modify(prot::PAGE_READONLY);
        assert_eq!(ro.page(), 7);
        assert!(ro.dirty());
        assert!(!ro.write());
    }

    #[test]
    fn protection_map_private_write_is_cow() {
        // write bit set, shared clear: template must not be writable
        assert_eq!(PROTECTION_MAP[0b0010] & PTE_RW, 0);
        assert_eq!(PROTECTION_MAP[0b0011] & PTE_RW, 0);
        // shared + write: writable template
        assert_ne!(PROTECTION_MAP[0b1010] & PTE_RW, 0);
        assert_ne!(PROTECTION_MAP[0b1011] & PTE_RW, 0);
        // no access at all maps to PAGE_NONE (no user bit)
        assert_eq!(PROTECTION_MAP[0] & PTE_USER, 0);
    }

    #[test]
    fn index_split_covers_the_address() {
        let addr = (3u64 << PGDIR_SHIFT) | (5u64 << PMD_SHIFT) | (7u64 << PAGE_SHIFT) | 0x123;
        assert_eq!(pgd_index(addr), 3);
        assert_eq!(pmd_index(addr), 5);
        assert_eq!(pte_index(addr), 7);
    }

    #[test]
    fn flush_batch_records_per_task() {
        let mut tlb = TlbTracker::new();
        let mut batch = FlushBatch::new();
        batch.all(1);
        batch.page(2, 0x1234);
        batch.commit(&mut tlb);
        assert_eq!(tlb.flushes_for(1), 1);
        assert_eq!(tlb.events()[1], TlbEvent::Page(2, 0x1000));
    }
}
