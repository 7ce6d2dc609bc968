//! Page Frame Number (PFN) database.
//!
//! One [`PfnEntry`] per physical page frame, tracking whether the frame is
//! in use, whether it belongs to a pool-page allocation, and -- for the
//! first frame of a multi-page pool allocation -- the span length and the
//! allocation tag used by the tag tracker (`mm::tag_tracker`). This mirrors
//! the teacher's frame-metadata array (`mm/frame_allocator.rs`) but trades
//! its order-based buddy bitmap for a flat per-frame record, since the pool
//! layer above needs per-frame tag/span bookkeeping rather than buddy
//! coalescing.
//!
//! The database itself is bootstrapped from the early allocator (`mm::early`)
//! before any heap exists: its backing storage is a run of physical frames
//! claimed directly from the bump allocator, then addressed through the
//! bootloader's physical-memory mapping (see `arch::x86_64::msr::phys_to_virt`).

use core::ptr::NonNull;

use crate::error::{KernelError, KernelResult, MmError};
use crate::mm::types::{FrameNumber, PhysicalAddress, PAGE_SIZE};
use crate::panic::{fatal_error, PanicCode};
use crate::sync::{GlobalState, SpinLock};

/// Frame-granularity cache local to one CPU, sitting in front of the global
/// free list the same way `mm::pool_page::CacheBucket` sits in front of
/// `PoolPageAllocator`'s free lists.
const SINGLE_CACHE_CAPACITY: usize = 16;
const SINGLE_CACHE_BATCH: usize = 4;
const SINGLE_CACHE_LOW_WATERMARK: usize = 4;
const SINGLE_CACHE_HIGH_WATERMARK: usize = 12;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfnFlags: u8 {
        /// Frame is currently allocated (to anyone).
        const USED      = 1 << 0;
        /// Frame is part of a pool-page allocation (small-block pool sits atop it).
        const POOL_ITEM = 1 << 1;
        /// Frame is the first page of a multi-page pool-page allocation; `pages`
        /// and `tag` on this entry describe the whole span.
        const POOL_BASE = 1 << 2;
    }
}

/// Per-frame metadata record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PfnEntry {
    pub flags: PfnFlags,
    /// Span length in pages; meaningful only when `POOL_BASE` is set.
    pub pages: u32,
    /// 4-byte allocation tag (e.g. `*b"Pool"`); meaningful only when
    /// `POOL_BASE` is set.
    pub tag: [u8; 4],
}

impl PfnEntry {
    const fn empty() -> Self {
        Self { flags: PfnFlags::empty(), pages: 0, tag: [0; 4] }
    }
}

pub struct PfnDatabase {
    base: NonNull<PfnEntry>,
    frame_count: usize,
    /// Head of the global singly-linked free list, threaded through each
    /// free frame's own first 8 bytes via the physical-memory map (same
    /// trick `mm::pool_page::FreeList` uses for whole pool-page spans).
    free_head: Option<FrameNumber>,
    free_count: usize,
}

// SAFETY: the database's backing storage is frames claimed exclusively for
// this purpose during boot; all access after that goes through the
// `SpinLock` wrapper in `PFN_DB`.
unsafe impl Send for PfnDatabase {}

impl PfnDatabase {
    /// Build a PFN database covering `frame_count` frames, claiming its own
    /// backing storage from the early allocator.
    pub fn init(frame_count: usize, early: &mut super::early::EarlyAllocator) -> KernelResult<Self> {
        let bytes = frame_count * core::mem::size_of::<PfnEntry>();
        let pages = bytes.div_ceil(PAGE_SIZE);
        let phys = early.alloc_pages(pages)?;
        let virt = crate::arch::x86_64::msr::phys_to_virt(phys.as_u64() as usize)
            .ok_or(KernelError::Memory(MmError::InvalidAddress { addr: phys.as_u64() as usize }))?;
        let base = NonNull::new(virt as *mut PfnEntry)
            .ok_or(KernelError::Memory(MmError::InvalidAddress { addr: virt }))?;
        // SAFETY: `base` points to `pages` freshly claimed, zeroed frames
        // (early allocator hands out frames from untouched loader-reported
        // RAM), large enough for `frame_count` entries.
        unsafe {
            for i in 0..frame_count {
                base.as_ptr().add(i).write(PfnEntry::empty());
            }
        }
        Ok(Self { base, frame_count, free_head: None, free_count: 0 })
    }

    fn entry(&self, frame: FrameNumber) -> &PfnEntry {
        assert!(frame.as_usize() < self.frame_count, "frame {} out of range", frame.0);
        // SAFETY: bounds-checked above; `base` spans `frame_count` entries.
        unsafe { &*self.base.as_ptr().add(frame.as_usize()) }
    }

    fn entry_mut(&mut self, frame: FrameNumber) -> &mut PfnEntry {
        assert!(frame.as_usize() < self.frame_count, "frame {} out of range", frame.0);
        // SAFETY: bounds-checked above; `&mut self` gives exclusive access.
        unsafe { &mut *self.base.as_ptr().add(frame.as_usize()) }
    }

    pub fn is_used(&self, frame: FrameNumber) -> bool {
        self.entry(frame).flags.contains(PfnFlags::USED)
    }

    pub fn mark_used(&mut self, frame: FrameNumber) {
        self.entry_mut(frame).flags.insert(PfnFlags::USED);
    }

    pub fn mark_free(&mut self, frame: FrameNumber) {
        *self.entry_mut(frame) = PfnEntry::empty();
    }

    fn mark_free_span(&mut self, base: FrameNumber, pages: u32) {
        for i in 0..pages as u64 {
            self.mark_free(FrameNumber(base.0 + i));
        }
    }

    /// Push `frame` onto the global free list. The frame must not currently
    /// be referenced by anything -- its first 8 bytes become the link to the
    /// previous head.
    fn push_free(&mut self, frame: FrameNumber) {
        let link = free_link_ptr(frame);
        let next = self.free_head.map(|f| f.0).unwrap_or(u64::MAX);
        // SAFETY: `frame` is free and reachable through the direct physical
        // map; nothing else holds a reference to its contents.
        unsafe { link.write(next) };
        self.free_head = Some(frame);
        self.free_count += 1;
    }

    fn pop_free(&mut self) -> Option<FrameNumber> {
        let head = self.free_head?;
        let link = free_link_ptr(head);
        // SAFETY: `head` was pushed by `push_free`, which wrote a valid link
        // word at this address.
        let next = unsafe { link.read() };
        self.free_head = if next == u64::MAX { None } else { Some(FrameNumber(next)) };
        self.free_count -= 1;
        Some(head)
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Record that `frame` begins a `pages`-long pool-page span tagged `tag`.
    pub fn mark_pool_base(&mut self, frame: FrameNumber, pages: u32, tag: [u8; 4]) {
        let e = self.entry_mut(frame);
        e.flags = PfnFlags::USED | PfnFlags::POOL_ITEM | PfnFlags::POOL_BASE;
        e.pages = pages;
        e.tag = tag;
        for i in 1..pages as u64 {
            let follower = self.entry_mut(FrameNumber(frame.0 + i));
            follower.flags = PfnFlags::USED | PfnFlags::POOL_ITEM;
        }
    }

    pub fn pool_span(&self, frame: FrameNumber) -> Option<(u32, [u8; 4])> {
        let e = self.entry(frame);
        if e.flags.contains(PfnFlags::POOL_BASE) {
            Some((e.pages, e.tag))
        } else {
            None
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
}

/// Address of the link word inside a free frame, through the bootloader's
/// direct physical-memory map.
fn free_link_ptr(frame: FrameNumber) -> *mut u64 {
    let phys = frame.to_phys().as_u64() as usize;
    crate::arch::x86_64::msr::phys_to_virt(phys)
        .expect("free frame must be covered by the direct physical map") as *mut u64
}

static PFN_DB: GlobalState<SpinLock<PfnDatabase>> = GlobalState::new();

pub fn init(frame_count: usize, early: &mut super::early::EarlyAllocator) -> KernelResult<()> {
    let db = PfnDatabase::init(frame_count, early)?;
    PFN_DB
        .init(SpinLock::new(db))
        .map_err(|_| KernelError::AlreadyExists { resource: "pfn database", id: 0 })
}

pub fn with<R>(f: impl FnOnce(&mut PfnDatabase) -> R) -> R {
    PFN_DB
        .with(|lock| f(&mut lock.lock()))
        .expect("pfn database used before init")
}

/// Hand a physical frame straight to the global free list. Called once per
/// frame while draining `EarlyAllocator`'s remaining capacity during
/// `mm::init`, after the PFN database itself has claimed its own backing
/// storage.
pub fn seed_free_page(addr: PhysicalAddress) {
    with(|db| db.push_free(addr.frame()));
}

/// Frame-granularity cache local to one CPU; lives on `cpu::PerCpu` next to
/// `mm::pool_page::PerCpuPageCache`.
pub struct SinglePageCache {
    entries: [u64; SINGLE_CACHE_CAPACITY],
    len: usize,
}

impl SinglePageCache {
    pub const fn new() -> Self {
        Self { entries: [0; SINGLE_CACHE_CAPACITY], len: 0 }
    }

    fn push(&mut self, frame: FrameNumber) -> bool {
        if self.len >= SINGLE_CACHE_CAPACITY {
            return false;
        }
        self.entries[self.len] = frame.0;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<FrameNumber> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(FrameNumber(self.entries[self.len]))
    }
}

impl Default for SinglePageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a single physical frame: per-CPU cache first, refilled in
/// batches from the global free list on miss (§4.1's "O(1) per-CPU free list
/// falling back to a global free-list-guarded-by-spin-lock").
pub fn allocate_single_page() -> KernelResult<PhysicalAddress> {
    let cache_lock = &crate::cpu::current().single_page_cache;
    let mut cache = cache_lock.lock();
    if cache.len < SINGLE_CACHE_LOW_WATERMARK {
        for _ in 0..SINGLE_CACHE_BATCH {
            match with(|db| db.pop_free()) {
                Some(frame) => {
                    if !cache.push(frame) {
                        with(|db| db.push_free(frame));
                        break;
                    }
                }
                None => break,
            }
        }
    }
    if let Some(frame) = cache.pop() {
        with(|db| db.mark_used(frame));
        return Ok(frame.to_phys());
    }
    drop(cache);
    match with(|db| db.pop_free()) {
        Some(frame) => {
            with(|db| db.mark_used(frame));
            Ok(frame.to_phys())
        }
        None => Err(KernelError::Memory(MmError::OutOfMemory { requested: PAGE_SIZE, available: 0 })),
    }
}

/// Return a single frame allocated by `allocate_single_page`. Fatal if `addr`
/// is not a plain single-page allocation (e.g. a follower frame of a
/// pool-page span, which must go through `free_pool_span` instead).
pub fn free_single_page(addr: PhysicalAddress) -> KernelResult<()> {
    let frame = addr.frame();
    let ok = with(|db| {
        let e = db.entry(frame);
        if e.flags.contains(PfnFlags::USED) && !e.flags.contains(PfnFlags::POOL_ITEM) {
            db.mark_free(frame);
            true
        } else {
            false
        }
    });
    if !ok {
        fatal_error(PanicCode::BadPfnHeader, frame.0, 0, 0, 0);
    }

    let cache_lock = &crate::cpu::current().single_page_cache;
    let mut cache = cache_lock.lock();
    if cache.len >= SINGLE_CACHE_HIGH_WATERMARK {
        for _ in 0..SINGLE_CACHE_BATCH {
            match cache.pop() {
                Some(drained) => with(|db| db.push_free(drained)),
                None => break,
            }
        }
    }
    if !cache.push(frame) {
        drop(cache);
        with(|db| db.push_free(frame));
    }
    Ok(())
}

/// Release a whole pool-page span back to the frame allocator. `base` must
/// be the span's recorded `POOL_BASE` frame and `expected_pages` must match
/// the span length `mark_pool_base` recorded; any mismatch means the caller
/// is freeing something other than the span it thinks it owns.
pub fn free_pool_span(base: FrameNumber, expected_pages: u32) -> KernelResult<()> {
    let ok = with(|db| match db.pool_span(base) {
        Some((pages, _)) if pages == expected_pages => {
            db.mark_free_span(base, pages);
            true
        }
        _ => false,
    });
    if !ok {
        fatal_error(PanicCode::BadPfnHeader, base.0, expected_pages as u64, 0, 0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_flags_roundtrip() {
        let mut e = PfnEntry::empty();
        e.flags.insert(PfnFlags::USED);
        assert!(e.flags.contains(PfnFlags::USED));
        assert!(!e.flags.contains(PfnFlags::POOL_BASE));
    }
}
