//! Virtual address map (L4): page-table manipulation built on top of the
//! bootloader's physical-memory offset mapping.
//!
//! `arch::x86_64::mod`'s `tlb_flush_address`/`tlb_flush_all` own the raw TLB
//! primitives; this module is the layer above that actually walks and edits
//! page tables, using the `x86_64` crate's typed `OffsetPageTable`/`Mapper`
//! rather than hand-rolled table-entry math. The physical frame source for
//! intermediate page-table frames is `mm::pfn::allocate_single_page`,
//! wrapped in a `FrameAllocator` adapter -- not `mm::pool_page`, which itself
//! calls back into `map_page` to back its own virtual-address window, and
//! would deadlock/recurse through this adapter if it were the source here.

use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{KernelError, KernelResult, MmError};
use crate::mm::pfn;
use crate::mm::types::{PageFlags, PhysicalAddress, VirtualAddress};

/// Adapts the single-frame allocator to the `x86_64` crate's `FrameAllocator`
/// trait so `Mapper::map_to` can pull intermediate page-table frames without
/// depending on anything built on top of `map_page` itself.
struct PoolFrameAllocator;

// SAFETY: every frame handed out comes from `pfn::allocate_single_page`,
// which only ever returns frames it owns exclusively.
unsafe impl FrameAllocator<Size4KiB> for PoolFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let phys = pfn::allocate_single_page().ok()?;
        PhysFrame::from_start_address(PhysAddr::new(phys.0)).ok()
    }
}

fn phys_mem_offset() -> KernelResult<VirtAddr> {
    let offset = crate::arch::x86_64::msr::phys_to_virt(0)
        .ok_or(KernelError::Memory(MmError::InvalidAddress { addr: 0 }))?;
    Ok(VirtAddr::new(offset as u64))
}

/// Build an `OffsetPageTable` over the currently active CR3, using the
/// bootloader's physical-memory offset mapping to reach table frames.
///
/// # Safety
/// The caller must ensure the returned mapper is not used concurrently
/// with another live mapper over the same tables (this kernel only builds
/// one at a time, under the MM init lock or during single-threaded boot).
unsafe fn active_mapper() -> KernelResult<OffsetPageTable<'static>> {
    let offset = phys_mem_offset()?;
    let (frame, _) = x86_64::registers::control::Cr3::read();
    let phys = frame.start_address().as_u64();
    let virt = offset + phys;
    let table: *mut PageTable = virt.as_mut_ptr();
    Ok(OffsetPageTable::new(&mut *table, offset))
}

fn to_mapper_flags(flags: PageFlags) -> PageTableFlags {
    let mut out = PageTableFlags::empty();
    if flags.contains(PageFlags::PRESENT) {
        out |= PageTableFlags::PRESENT;
    }
    if flags.contains(PageFlags::WRITABLE) {
        out |= PageTableFlags::WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        out |= PageTableFlags::USER_ACCESSIBLE;
    }
    if flags.contains(PageFlags::WRITE_THROUGH) {
        out |= PageTableFlags::WRITE_THROUGH;
    }
    if flags.contains(PageFlags::NO_CACHE) {
        out |= PageTableFlags::NO_CACHE;
    }
    if flags.contains(PageFlags::HUGE) {
        out |= PageTableFlags::HUGE_PAGE;
    }
    if flags.contains(PageFlags::GLOBAL) {
        out |= PageTableFlags::GLOBAL;
    }
    if flags.contains(PageFlags::NO_EXECUTE) {
        out |= PageTableFlags::NO_EXECUTE;
    }
    out
}

/// Map a single 4 KiB page, allocating any missing intermediate page-table
/// frames from the pool allocator.
pub fn map_page(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> KernelResult<()> {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt.0));
    let frame = PhysFrame::containing_address(PhysAddr::new(phys.0));
    let table_flags = to_mapper_flags(flags);

    // SAFETY: single mapper in use at a time, see `active_mapper`.
    let mut mapper = unsafe { active_mapper()? };
    let mut allocator = PoolFrameAllocator;

    // SAFETY: `phys` is caller-owned physical memory (typically just handed
    // out by `pfn::allocate_single_page`), and `virt` is a caller-chosen,
    // currently-unmapped virtual address.
    unsafe {
        mapper
            .map_to(page, frame, table_flags, &mut allocator)
            .map_err(|_| KernelError::Memory(MmError::InvalidAddress { addr: virt.0 as usize }))?
            .flush();
    }
    Ok(())
}

/// Unmap a single 4 KiB page and flush its TLB entry. Does not free the
/// physical frame backing it -- callers that own the frame return it to
/// `pool_page` themselves.
pub fn unmap_page(virt: VirtualAddress) -> KernelResult<()> {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt.0));

    // SAFETY: single mapper in use at a time, see `active_mapper`.
    let mut mapper = unsafe { active_mapper()? };
    let (_frame, flush) = mapper
        .unmap(page)
        .map_err(|_| KernelError::Memory(MmError::InvalidAddress { addr: virt.0 as usize }))?;
    flush.flush();
    Ok(())
}

/// Translate a virtual address to its backing physical address, if mapped.
pub fn translate(virt: VirtualAddress) -> Option<PhysicalAddress> {
    use x86_64::structures::paging::mapper::Translate;

    // SAFETY: single mapper in use at a time, see `active_mapper`.
    let mapper = unsafe { active_mapper().ok()? };
    mapper.translate_addr(VirtAddr::new(virt.0)).map(|a| PhysicalAddress(a.as_u64()))
}
