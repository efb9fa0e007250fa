//! Pooled small-object allocator (kalloc / kfree)
//!
//! Fixed size classes carved out of frame runs. Every run starts with a
//! page descriptor; every block carries a header with a sentinel word, so
//! a double free or a stray pointer is caught before it corrupts a chain.
//! DMA allocations use a parallel page chain per class; a page serves DMA
//! or normal blocks for its whole lifetime, never both.
//!
//! All addresses are byte offsets into the physical arena. Offset 0 lands
//! in a RESERVED boot frame and never holds an allocator page, so 0 doubles
//! as the null link.

use alloc::vec::Vec;

use super::frame::{gfp, FrameAllocator};
use super::{KernelError, PAGE_SIZE};

/// Block header sentinel: block is handed out
pub const MF_USED: u64 = 0xffaa_0055;
/// Block header sentinel: block is on a free chain
pub const MF_FREE: u64 = 0x0055_ffaa;

/// Block header: sentinel word plus length-in-use (USED) or next-free link
/// (FREE)
const BH_SIZE: usize = 16;
const BH_FLAGS: usize = 0;
const BH_LEN_OR_NEXT: usize = 8;

/// Page descriptor at the front of every run: next run in the class chain,
/// first free block, order word (class index + DMA bit), free block count
const PD_SIZE: usize = 32;
const PD_NEXT: usize = 0;
const PD_FIRSTFREE: usize = 8;
const PD_ORDER: usize = 16;
const PD_NFREE: usize = 24;

/// DMA marker inside the descriptor's order word
const ORDER_DMA: u64 = 1 << 32;

/// How many times to retry after formatting a fresh page before declaring
/// the impossible
const MAX_GET_FREE_PAGE_TRIES: usize = 4;

/// (block size including header, blocks per run, frame order of the run).
/// Sizes are powers of two minus the descriptor overhead; classes past one
/// page hold a single block.
const SIZES: &[(usize, usize, usize)] = &[
    (32, 127, 0),
    (64, 63, 0),
    (128, 31, 0),
    (252, 16, 0),
    (508, 8, 0),
    (1016, 4, 0),
    (2032, 2, 0),
    (4064, 1, 0),
    (8160, 1, 1),
    (16352, 1, 2),
    (32736, 1, 3),
    (65504, 1, 4),
    (131040, 1, 5),
];

/// Largest servable request
pub const MAX_KALLOC: usize = 131040 - BH_SIZE;

/// Per-class state and statistics.
#[derive(Clone, Default)]
struct SizeClass {
    /// Head of the free-page chain (arena address of a page descriptor)
    firstfree: usize,
    /// Head of the DMA free-page chain
    dmafree: usize,
    nmallocs: u64,
    nfrees: u64,
    nbytesmalloced: i64,
    npages: u64,
}

pub struct KallocPool {
    classes: Vec<SizeClass>,
    misuse_reports: u32,
}

fn blocksize(order: usize) -> usize {
    SIZES[order].0
}

fn nblocks(order: usize) -> usize {
    SIZES[order].1
}

fn gfporder(order: usize) -> usize {
    SIZES[order].2
}

fn areasize(order: usize) -> usize {
    PAGE_SIZE << gfporder(order)
}

/// Smallest class whose blocks fit `size` plus the header.
fn get_order(size: usize) -> Option<usize> {
    let needed = size + BH_SIZE;
    SIZES.iter().position(|&(bs, _, _)| needed <= bs)
}

impl KallocPool {
    pub fn new() -> Self {
        // Late "compile time" check: things blow up terribly if the static
        // table ever stops fitting its runs.
        for order in 0..SIZES.len() {
            assert!(
                nblocks(order) * blocksize(order) + PD_SIZE <= areasize(order),
                "size class {} overflows its run",
                order
            );
        }
        Self { classes: alloc::vec![SizeClass::default(); SIZES.len()], misuse_reports: 0 }
    }

    /// Allocate `size` bytes. `in_irq` is the interrupt-nesting state of
    /// the caller; anything but ATOMIC priority from interrupt context is
    /// diagnosed and downgraded.
    pub fn kalloc(
        &mut self,
        phys: &mut FrameAllocator,
        size: usize,
        mut priority: u32,
        in_irq: bool,
    ) -> Result<usize, KernelError> {
        let dma = priority & gfp::GFP_DMA != 0;
        if in_irq && priority & gfp::GFP_LEVEL_MASK != gfp::GFP_ATOMIC {
            if self.misuse_reports < 5 {
                self.misuse_reports += 1;
                log::warn!("[KALLOC] non-atomic allocation from interrupt context");
            }
            priority = gfp::GFP_ATOMIC | (priority & gfp::GFP_DMA);
        }

        let order = match get_order(size) {
            Some(order) => order,
            None => {
                log::warn!("[KALLOC] request for {} bytes exceeds the largest class", size);
                return Err(KernelError::InvalidArg);
            }
        };

        let mut tries = MAX_GET_FREE_PAGE_TRIES;
        while tries > 0 {
            tries -= 1;
            let page = if dma { self.classes[order].dmafree } else { self.classes[order].firstfree };
            if page != 0 {
                let block = phys.read_u64_at(page + PD_FIRSTFREE) as usize;
                if block != 0 {
                    if phys.read_u64_at(block + BH_FLAGS) != MF_FREE {
                        log::error!("[KALLOC] block {:#x} on free chain is not free", block);
                        return Err(KernelError::Corrupted);
                    }
                    let next_free = phys.read_u64_at(block + BH_LEN_OR_NEXT);
                    phys.write_u64_at(page + PD_FIRSTFREE, next_free);
                    let nfree = phys.read_u64_at(page + PD_NFREE) - 1;
                    phys.write_u64_at(page + PD_NFREE, nfree);
                    if nfree == 0 {
                        // Page went full: detach it from the class chain.
                        let next_page = phys.read_u64_at(page + PD_NEXT);
                        if dma {
                            self.classes[order].dmafree = next_page as usize;
                        } else {
                            self.classes[order].firstfree = next_page as usize;
                        }
                        phys.write_u64_at(page + PD_NEXT, 0);
                    }
                    self.classes[order].nmallocs += 1;
                    self.classes[order].nbytesmalloced += size as i64;
                    phys.write_u64_at(block + BH_FLAGS, MF_USED);
                    phys.write_u64_at(block + BH_LEN_OR_NEXT, size as u64);
                    return Ok(block + BH_SIZE);
                }
            }

            // No block handy: format a fresh run and retry.
            let frame = if dma {
                phys.alloc_dma(gfporder(order), priority)
            } else {
                phys.alloc(gfporder(order), priority)
            };
            let Some(frame) = frame else {
                log::warn!("[KALLOC] no free page for a {} byte allocation", size);
                return Err(KernelError::NoMemory);
            };
            let page = frame * PAGE_SIZE;
            self.classes[order].npages += 1;

            let sz = blocksize(order);
            let mut block = page + PD_SIZE;
            for i in 0..nblocks(order) {
                phys.write_u64_at(block + BH_FLAGS, MF_FREE);
                let next = if i + 1 == nblocks(order) { 0 } else { (block + sz) as u64 };
                phys.write_u64_at(block + BH_LEN_OR_NEXT, next);
                block += sz;
            }
            let order_word = order as u64 | if dma { ORDER_DMA } else { 0 };
            phys.write_u64_at(page + PD_ORDER, order_word);
            phys.write_u64_at(page + PD_NFREE, nblocks(order) as u64);
            phys.write_u64_at(page + PD_FIRSTFREE, (page + PD_SIZE) as u64);
            if dma {
                phys.write_u64_at(page + PD_NEXT, self.classes[order].dmafree as u64);
                self.classes[order].dmafree = page;
            } else {
                phys.write_u64_at(page + PD_NEXT, self.classes[order].firstfree as u64);
                self.classes[order].firstfree = page;
            }
        }

        // Only reachable if freshly formatted pages keep being drained
        // between the format and the retry.
        log::error!("[KALLOC] retries exhausted for a {} byte allocation", size);
        Err(KernelError::NoMemory)
    }

    /// Free a block. `size`, when non-zero, must match the recorded
    /// allocation length; a mismatch aborts the free and leaves the block
    /// alone.
    pub fn kfree(&mut self, phys: &mut FrameAllocator, ptr: usize, size: usize) {
        if ptr < PD_SIZE + BH_SIZE {
            log::error!("[KALLOC] kfree of bad pointer {:#x}", ptr);
            return;
        }
        let block = ptr - BH_SIZE;
        let page = ptr & !(PAGE_SIZE - 1);
        let order_word = phys.read_u64_at(page + PD_ORDER);
        let order = (order_word & 0xffff_ffff) as usize;
        let dma = order_word & ORDER_DMA != 0;
        let next = phys.read_u64_at(page + PD_NEXT) as usize;
        if order >= SIZES.len()
            || next & (PAGE_SIZE - 1) != 0
            || phys.read_u64_at(block + BH_FLAGS) != MF_USED
        {
            log::error!(
                "[KALLOC] kfree of non-kalloced memory: {:#x}, next={:#x}, order={}",
                ptr,
                next,
                order
            );
            return;
        }
        let recorded = phys.read_u64_at(block + BH_LEN_OR_NEXT) as usize;
        if size != 0 && size != recorded {
            log::error!(
                "[KALLOC] kfree of {:#x} with wrong size: {} instead of {}",
                ptr,
                size,
                recorded
            );
            return;
        }

        phys.write_u64_at(block + BH_FLAGS, MF_FREE);
        phys.write_u64_at(block + BH_LEN_OR_NEXT, phys.read_u64_at(page + PD_FIRSTFREE));
        phys.write_u64_at(page + PD_FIRSTFREE, block as u64);
        let nfree = phys.read_u64_at(page + PD_NFREE) + 1;
        phys.write_u64_at(page + PD_NFREE, nfree);

        if nfree == 1 {
            // Full page gained a free block: hook it back onto its chain.
            if next != 0 {
                log::error!("[KALLOC] page {:#x} already on a free chain", page);
            } else if dma {
                phys.write_u64_at(page + PD_NEXT, self.classes[order].dmafree as u64);
                self.classes[order].dmafree = page;
            } else {
                phys.write_u64_at(page + PD_NEXT, self.classes[order].firstfree as u64);
                self.classes[order].firstfree = page;
            }
        }

        if nfree as usize == nblocks(order) {
            self.unlink_page(phys, order, page);
            phys.free(page / PAGE_SIZE, gfporder(order));
            self.classes[order].npages -= 1;
        }

        self.classes[order].nfrees += 1;
        self.classes[order].nbytesmalloced -= recorded as i64;
    }

    fn unlink_page(&mut self, phys: &mut FrameAllocator, order: usize, page: usize) {
        if self.classes[order].firstfree == page {
            self.classes[order].firstfree = phys.read_u64_at(page + PD_NEXT) as usize;
            return;
        }
        if self.classes[order].dmafree == page {
            self.classes[order].dmafree = phys.read_u64_at(page + PD_NEXT) as usize;
            return;
        }
        for head in [self.classes[order].firstfree, self.classes[order].dmafree] {
            let mut cur = head;
            while cur != 0 {
                let next = phys.read_u64_at(cur + PD_NEXT) as usize;
                if next == page {
                    phys.write_u64_at(cur + PD_NEXT, phys.read_u64_at(page + PD_NEXT));
                    return;
                }
                cur = next;
            }
        }
        log::error!("[KALLOC] page {:#x} missing from its free chain", page);
    }

    /// Free blocks recorded for the page holding `ptr` (diagnostics).
    pub fn page_nfree(&self, phys: &FrameAllocator, ptr: usize) -> usize {
        let page = ptr & !(PAGE_SIZE - 1);
        phys.read_u64_at(page + PD_NFREE) as usize
    }

    /// (allocations, frees, bytes outstanding, pages) for the class
    /// serving `size`.
    pub fn class_stats(&self, size: usize) -> Option<(u64, u64, i64, u64)> {
        let order = get_order(size)?;
        let c = &self.classes[order];
        Some((c.nmallocs, c.nfrees, c.nbytesmalloced, c.npages))
    }

    /// Consistency check over every class chain: each page's `nfree` must
    /// equal its chain length and every chained block must carry the FREE
    /// sentinel. Returns the number of violations.
    pub fn verify_chains(&self, phys: &FrameAllocator) -> usize {
        let mut bad = 0;
        for (order, class) in self.classes.iter().enumerate() {
            for head in [class.firstfree, class.dmafree] {
                let mut page = head;
                while page != 0 {
                    let nfree = phys.read_u64_at(page + PD_NFREE);
                    let mut chain = 0u64;
                    let mut block = phys.read_u64_at(page + PD_FIRSTFREE) as usize;
                    while block != 0 && chain <= nblocks(order) as u64 {
                        if phys.read_u64_at(block + BH_FLAGS) != MF_FREE {
                            log::error!("[KALLOC] chained block {:#x} lacks FREE sentinel", block);
                            bad += 1;
                            break;
                        }
                        chain += 1;
                        block = phys.read_u64_at(block + BH_LEN_OR_NEXT) as usize;
                    }
                    if chain != nfree {
                        log::error!(
                            "[KALLOC] page {:#x}: nfree {} but chain holds {}",
                            page,
                            nfree,
                            chain
                        );
                        bad += 1;
                    }
                    page = phys.read_u64_at(page + PD_NEXT) as usize;
                }
            }
        }
        bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (FrameAllocator, KallocPool) {
        (FrameAllocator::new(256, 32, 2), KallocPool::new())
    }

    #[test]
    fn three_small_blocks_share_one_page() {
        let (mut phys, mut pool) = setup();
        let a = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        let b = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        let c = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        // 40 + header rounds up to the 64-byte class: 63 blocks per page.
        assert_eq!(a & !(PAGE_SIZE - 1), b & !(PAGE_SIZE - 1));
        assert_eq!(b & !(PAGE_SIZE - 1), c & !(PAGE_SIZE - 1));
        assert_eq!(b - a, 64);
        assert_eq!(pool.page_nfree(&phys, a), 63 - 3);
        assert_eq!(pool.verify_chains(&phys), 0);
    }

    #[test]
    fn kalloc_kfree_restores_accounting() {
        let (mut phys, mut pool) = setup();
        let free0 = phys.nr_free();
        let p = pool.kalloc(&mut phys, 100, gfp::GFP_KERNEL, false).unwrap();
        pool.kfree(&mut phys, p, 100);
        let (m, f, bytes, pages) = pool.class_stats(100).unwrap();
        assert_eq!(m, 1);
        assert_eq!(f, 1);
        assert_eq!(bytes, 0);
        assert_eq!(pages, 0);
        assert_eq!(phys.nr_free(), free0);
    }

    #[test]
    fn double_free_is_caught() {
        let (mut phys, mut pool) = setup();
        let a = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        let b = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        pool.kfree(&mut phys, a, 0);
        pool.kfree(&mut phys, a, 0); // sentinel is FREE now: refused
        assert_eq!(pool.verify_chains(&phys), 0);
        pool.kfree(&mut phys, b, 0);
    }

    #[test]
    fn size_mismatch_is_refused() {
        let (mut phys, mut pool) = setup();
        let p = pool.kalloc(&mut phys, 200, gfp::GFP_KERNEL, false).unwrap();
        pool.kfree(&mut phys, p, 100);
        // Block is still allocated; the correct size frees it.
        let (_, f, _, _) = pool.class_stats(200).unwrap();
        assert_eq!(f, 0);
        pool.kfree(&mut phys, p, 200);
        let (_, f, _, _) = pool.class_stats(200).unwrap();
        assert_eq!(f, 1);
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let (mut phys, mut pool) = setup();
        let free0 = phys.nr_free();
        assert_eq!(pool.kalloc(&mut phys, MAX_KALLOC + 1, gfp::GFP_KERNEL, false), Err(KernelError::InvalidArg));
        assert_eq!(phys.nr_free(), free0);
    }

    #[test]
    fn multi_page_class_allocates_a_run() {
        let (mut phys, mut pool) = setup();
        let p = pool.kalloc(&mut phys, 10_000, gfp::GFP_KERNEL, false).unwrap();
        phys.slice_mut(p, 10_000).fill(0xa5);
        pool.kfree(&mut phys, p, 10_000);
        assert_eq!(pool.verify_chains(&phys), 0);
    }

    #[test]
    fn dma_pages_stay_on_the_dma_chain() {
        let (mut phys, mut pool) = setup();
        let a = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL | gfp::GFP_DMA, false).unwrap();
        let b = pool.kalloc(&mut phys, 40, gfp::GFP_KERNEL, false).unwrap();
        // Parallel chains: the two 64-byte blocks live on different pages.
        assert_ne!(a & !(PAGE_SIZE - 1), b & !(PAGE_SIZE - 1));
        assert!(a / PAGE_SIZE < 32);
        pool.kfree(&mut phys, a, 40);
        pool.kfree(&mut phys, b, 40);
        assert_eq!(pool.verify_chains(&phys), 0);
    }

    #[test]
    fn interrupt_misuse_is_downgraded_not_fatal() {
        let (mut phys, mut pool) = setup();
        let p = pool.kalloc(&mut phys, 64, gfp::GFP_KERNEL, true).unwrap();
        pool.kfree(&mut phys, p, 0);
    }

    #[test]
    fn draining_a_class_reuses_detached_pages() {
        let (mut phys, mut pool) = setup();
        let mut held = alloc::vec::Vec::new();
        // 2032-byte class: two blocks per page; drain a few pages dry.
        for _ in 0..6 {
            held.push(pool.kalloc(&mut phys, 2000, gfp::GFP_KERNEL, false).unwrap());
        }
        assert_eq!(pool.verify_chains(&phys), 0);
        for p in held.drain(..) {
            pool.kfree(&mut phys, p, 2000);
        }
        let (_, _, bytes, pages) = pool.class_stats(2000).unwrap();
        assert_eq!(bytes, 0);
        assert_eq!(pages, 0);
    }
}
