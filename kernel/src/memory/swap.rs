//! Swap manager
//!
//! Swap slots, their on-device reference counts, page I/O against an
//! opaque device, and the swap cache. The cache maps a resident frame to
//! the slot it was read from so an unchanged frame can be evicted again
//! without rewriting it.
//!
//! Swap identifiers are non-present PTE values: slot number shifted into
//! the upper bits, zero meaning "no swap". Shared-segment signatures use
//! the same non-present space with a marker bit; the slot operations here
//! ignore them, the segment engine owns their lifetime.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::frame::{FrameAllocator, FrameNo};
use super::PAGE_SIZE;

/// Bit position of the slot number inside a swap id
pub const SWAP_SLOT_SHIFT: u32 = 8;

/// Marker bit distinguishing shared-segment signatures from swap ids
pub const SHM_SWP_TYPE: u64 = 1 << 1;

/// Ceiling for per-slot reference counts; beyond it the count sticks
const SWAP_MAP_MAX: u8 = 0x7f;

/// Statistics
static PAGES_SWAPPED_OUT: AtomicU64 = AtomicU64::new(0);
static PAGES_SWAPPED_IN: AtomicU64 = AtomicU64::new(0);

/// Encode a slot number as a swap id.
pub fn swap_entry(slot: usize) -> u64 {
    (slot as u64) << SWAP_SLOT_SHIFT
}

/// Slot number of a swap id.
pub fn swap_slot(id: u64) -> usize {
    (id >> SWAP_SLOT_SHIFT) as usize
}

/// True for shared-segment signature values, which only look like swap ids.
pub fn is_shm_signature(id: u64) -> bool {
    id & SHM_SWP_TYPE != 0
}

/// The device behind the swap area. The kernel treats it as an opaque
/// byte store; page I/O through it may suspend the caller.
pub trait SwapDevice: Send {
    fn read_page(&mut self, slot: usize, buf: &mut [u8]);
    fn write_page(&mut self, slot: usize, buf: &[u8]);
}

/// Default in-memory device (hosted runs, and the fallback when no disk
/// driver claimed the swap area).
pub struct MemSwapDevice {
    pages: BTreeMap<usize, Vec<u8>>,
}

impl MemSwapDevice {
    pub fn new() -> Self {
        Self { pages: BTreeMap::new() }
    }
}

impl SwapDevice for MemSwapDevice {
    fn read_page(&mut self, slot: usize, buf: &mut [u8]) {
        match self.pages.get(&slot) {
            Some(data) => buf.copy_from_slice(data),
            None => {
                log::warn!("[SWAP] read of never-written slot {}", slot);
                buf.fill(0);
            }
        }
    }

    fn write_page(&mut self, slot: usize, buf: &[u8]) {
        self.pages.insert(slot, buf.to_vec());
    }
}

pub struct SwapManager {
    device: Box<dyn SwapDevice>,
    /// Per-slot reference count; slot 0 is never used
    map: Vec<u8>,
    /// Resident frame -> the swap id its contents came from
    cache: BTreeMap<FrameNo, u64>,
    used_slots: usize,
    last_hint: usize,
}

impl SwapManager {
    pub fn new(slots: usize, device: Box<dyn SwapDevice>) -> Self {
        log::info!("[SWAP] {} slots ({} KB)", slots, slots * PAGE_SIZE / 1024);
        Self { device, map: vec![0u8; slots + 1], cache: BTreeMap::new(), used_slots: 0, last_hint: 1 }
    }

    pub fn total_slots(&self) -> usize {
        self.map.len() - 1
    }

    pub fn used_slots(&self) -> usize {
        self.used_slots
    }

    /// Allocate a swap slot. Returns the encoded id, or 0 when the area is
    /// exhausted.
    pub fn get_swap_page(&mut self) -> u64 {
        let slots = self.total_slots();
        if slots == 0 {
            return 0;
        }
        for off in 0..slots {
            let slot = 1 + (self.last_hint - 1 + off) % slots;
            if self.map[slot] == 0 {
                self.map[slot] = 1;
                self.used_slots += 1;
                self.last_hint = slot;
                return swap_entry(slot);
            }
        }
        0
    }

    /// Drop one reference to a swap slot, releasing it at zero.
    /// Shared-segment signatures pass through untouched.
    pub fn swap_free(&mut self, id: u64) {
        if id == 0 || is_shm_signature(id) {
            return;
        }
        let slot = swap_slot(id);
        if slot == 0 || slot >= self.map.len() {
            log::error!("[SWAP] swap_free of bad id {:#x}", id);
            return;
        }
        match self.map[slot] {
            0 => log::error!("[SWAP] swap_free of unused slot {}", slot),
            SWAP_MAP_MAX => {} // pinned, see swap_duplicate
            1 => {
                self.map[slot] = 0;
                self.used_slots -= 1;
            }
            _ => self.map[slot] -= 1,
        }
    }

    /// Add a reference to a swap slot (a second PTE now names it).
    /// Shared-segment signatures pass through untouched.
    pub fn swap_duplicate(&mut self, id: u64) {
        if id == 0 || is_shm_signature(id) {
            return;
        }
        let slot = swap_slot(id);
        if slot == 0 || slot >= self.map.len() || self.map[slot] == 0 {
            log::error!("[SWAP] swap_duplicate of bad id {:#x}", id);
            return;
        }
        if self.map[slot] < SWAP_MAP_MAX {
            self.map[slot] += 1;
        } else {
            log::warn!("[SWAP] slot {} refcount saturated", slot);
        }
    }

    /// On-device reference count of an id (diagnostics and tests).
    pub fn slot_refs(&self, id: u64) -> u8 {
        let slot = swap_slot(id);
        if slot == 0 || slot >= self.map.len() {
            0
        } else {
            self.map[slot]
        }
    }

    /// Read a slot's page into a frame. May suspend on device I/O.
    pub fn read_swap_page(&mut self, id: u64, frame: FrameNo, phys: &mut FrameAllocator) {
        let slot = swap_slot(id);
        if slot == 0 || slot >= self.map.len() || self.map[slot] == 0 {
            log::error!("[SWAP] read of bad swap id {:#x}", id);
            return;
        }
        self.device.read_page(slot, phys.page_mut(frame));
        PAGES_SWAPPED_IN.fetch_add(1, Ordering::Relaxed);
    }

    /// Write a frame out to a slot. May suspend on device I/O.
    pub fn write_swap_page(&mut self, id: u64, frame: FrameNo, phys: &FrameAllocator) {
        let slot = swap_slot(id);
        if slot == 0 || slot >= self.map.len() || self.map[slot] == 0 {
            log::error!("[SWAP] write to bad swap id {:#x}", id);
            return;
        }
        self.device.write_page(slot, phys.page(frame));
        PAGES_SWAPPED_OUT.fetch_add(1, Ordering::Relaxed);
    }

    // --- swap cache ---
    //
    // A cache entry holds one mem_map reference and one slot reference of
    // its own, so neither the frame nor the slot can disappear under it.

    /// Record that `frame` holds a clean copy of `id`. The caller already
    /// incremented both the frame and slot counts for the cache's benefit.
    pub fn add_to_swap_cache(&mut self, frame: FrameNo, id: u64) {
        if is_shm_signature(id) {
            return;
        }
        if let Some(old) = self.cache.insert(frame, id) {
            log::error!("[SWAP] frame {} already cached as {:#x}", frame, old);
        }
    }

    /// The swap id cached for a frame, if any.
    pub fn in_swap_cache(&self, frame: FrameNo) -> Option<u64> {
        self.cache.get(&frame).copied()
    }

    /// Reverse lookup: the resident frame already holding `id`, if any.
    pub fn find_cached(&self, id: u64) -> Option<FrameNo> {
        self.cache.iter().find(|&(_, &v)| v == id).map(|(&f, _)| f)
    }

    /// Drop a frame's cache entry, releasing the cache's slot reference.
    /// Returns true if there was one. The caller owns dropping the cache's
    /// frame reference (see `free_page_and_swap_cache`).
    pub fn delete_from_swap_cache(&mut self, frame: FrameNo) -> bool {
        if let Some(id) = self.cache.remove(&frame) {
            self.swap_free(id);
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> SwapStats {
        SwapStats {
            total_slots: self.total_slots(),
            used_slots: self.used_slots,
            cached: self.cache.len(),
            pages_swapped_out: PAGES_SWAPPED_OUT.load(Ordering::Relaxed),
            pages_swapped_in: PAGES_SWAPPED_IN.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SwapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub cached: usize,
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}

/// Drop one reference to a frame, tearing down a stale swap-cache entry if
/// that entry is about to become the only holder. Every path that clears a
/// present PTE goes through here.
pub fn free_page_and_swap_cache(phys: &mut FrameAllocator, swap: &mut SwapManager, frame: FrameNo) {
    if phys.out_of_range(frame) {
        return;
    }
    phys.free(frame, 0);
    if phys.ref_count(frame) == 1 && swap.in_swap_cache(frame).is_some() {
        swap.delete_from_swap_cache(frame);
        phys.free(frame, 0);
    }
}
