//! Memory management: early bootstrap, the physical-frame database, the
//! pool-page and small-block allocators, kernel stacks, and the virtual
//! address map.
//!
//! Initialization order mirrors the dependency chain: the early bump
//! allocator (`early`) is the only thing that can hand out physical memory
//! before the PFN database (`pfn`) itself has pages to track, so `pfn::init`
//! takes `&mut EarlyAllocator` directly rather than going through the pool
//! page layer. Once the PFN database's own backing storage is claimed, every
//! page `early` has left is drained straight into `pfn`'s free list
//! (`EarlyAllocator::drain_remaining` / `pfn::seed_free_page`) and `early` is
//! retired -- from that point on, `pfn::allocate_single_page` is the only
//! physical-page source, and `pool_page`/`pool`/`kstack` are all built on it.

pub mod early;
pub mod kstack;
pub mod pfn;
pub mod pool;
pub mod pool_page;
pub mod tag_tracker;
pub mod types;
pub mod vmm;

pub use types::{
    FrameNumber, MemoryRegion, PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE,
};

use crate::error::KernelResult;

/// Bring up every memory-management subsystem in dependency order. Called
/// once, early in L17 boot, after the loader's memory map has been parsed
/// into a `&'static [MemoryRegion]`.
pub fn init(regions: &'static [MemoryRegion]) -> KernelResult<()> {
    let mut early = early::EarlyAllocator::new(regions);

    let frame_count = regions.iter().map(|r| r.frame_count()).sum::<u64>() as usize;
    pfn::init(frame_count, &mut early)?;
    early.drain_remaining(pfn::seed_free_page);

    pool_page::init()?;
    pool::init()?;

    log::info!("mm: {} frames tracked, pool allocator online", frame_count);
    Ok(())
}

/// Back-compat entry point for code that has not yet threaded a real memory
/// map through boot; falls back to a single generous region so the rest of
/// the kernel can come up under QEMU's default configuration.
pub fn init_default() -> KernelResult<()> {
    static FALLBACK: &[MemoryRegion] =
        &[MemoryRegion { start: PhysicalAddress(0x10_0000), len: 256 * PAGE_SIZE as u64 * 1024, usable: true }];
    init(FALLBACK)
}
