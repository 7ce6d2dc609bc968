//! Small-block pool allocator -- the kernel's general-purpose heap.
//!
//! Every allocation carries a 4-byte tag for `mm::tag_tracker` accounting,
//! the same convention the Windows-style `ExAllocatePoolWithTag` uses and
//! the one the original implementation this kernel's pool is modeled on
//! follows. Blocks live on pool-page spans (`mm::pool_page`), rounded up to
//! 16-byte slots, and are tracked on one intrusive free list
//! (`sync::list::IntrusiveList`) per slot count -- `free[i]` holds only
//! blocks whose payload is exactly `(i + 1) * 16` bytes.
//!
//! Allocation strategy: scan upward from the bucket that exactly fits the
//! request; if the first non-empty bucket found is larger, split off the
//! remainder (if the remainder itself has room for a header and at least
//! one slot) and reinsert it into its own bucket. This design does not
//! coalesce neighbouring free blocks back together -- fragmentation is
//! bounded by the fact that every bucket holds only equal-sized blocks, and
//! a block that shrinks via splitting only ever gets smaller, never merges
//! back with whatever sits next to it in memory.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::{KernelError, KernelResult, MmError};
use crate::mm::types::{VirtualAddress, PAGE_SIZE};
use crate::sync::list::{IntrusiveList, Linked, ListLink};
use crate::sync::SpinLock;

/// Granularity every small-block allocation is rounded up to.
const SLOT_SIZE: usize = 16;
/// Largest slot count a single bucketed block can hold (`head_index` range
/// is 1..=this). Requests needing more slots than this bypass the buckets
/// entirely and go to [`Pool::alloc_large`].
const SMALL_BLOCK_MAX_SLOTS: usize = 255;

#[repr(C)]
struct BlockHeader {
    link: ListLink<BlockHeader>,
    tag: [u8; 4],
    /// Payload slot count (`payload_bytes = head_index * SLOT_SIZE`) for an
    /// ordinary bucketed block. Zero for a solo-span block (see `pages`).
    head_index: u32,
    /// Page count of the whole pool-page span, when this header is the
    /// sole block living on it (an `alloc_large` allocation). Zero for an
    /// ordinary bucketed block. Not part of the three-field header shape
    /// this is modeled on -- added so `free` can tell the two kinds apart
    /// without a second lookup; see `DESIGN.md`.
    pages: u32,
    in_use: bool,
}

// SAFETY: `link` is exclusively owned by the `IntrusiveList` that currently
// holds this block; `Linked` callers (the pool) never alias it.
unsafe impl Linked for BlockHeader {
    fn link(&self) -> &ListLink<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self> {
        &mut self.link
    }
}

impl BlockHeader {
    fn payload_ptr(this: NonNull<BlockHeader>) -> *mut u8 {
        // SAFETY: header is immediately followed by its payload.
        unsafe { (this.as_ptr() as *mut u8).add(size_of::<BlockHeader>()) }
    }

    unsafe fn from_payload(ptr: *mut u8) -> NonNull<BlockHeader> {
        let header = ptr.sub(size_of::<BlockHeader>()) as *mut BlockHeader;
        NonNull::new_unchecked(header)
    }

    /// Bytes granted to the caller: `head_index * 16` for a bucketed block,
    /// or the whole span minus its own header for a solo-span block.
    fn payload_size(&self) -> usize {
        if self.pages > 0 {
            self.pages as usize * PAGE_SIZE - size_of::<BlockHeader>()
        } else {
            self.head_index as usize * SLOT_SIZE
        }
    }
}

pub struct Pool {
    /// `free[i]` holds blocks with `head_index == i + 1`.
    free: [IntrusiveList<BlockHeader>; SMALL_BLOCK_MAX_SLOTS],
}

impl Pool {
    pub const fn new() -> Self {
        Self { free: [const { IntrusiveList::new() }; SMALL_BLOCK_MAX_SLOTS] }
    }

    /// Bring up the pool's own bookkeeping by carving its first page span
    /// into buckets tagged `b"Pool"` -- the self-referential bootstrap
    /// allocation restored from the original implementation.
    pub fn bootstrap(&mut self) -> KernelResult<()> {
        self.refill(1, *b"Pool")
    }

    /// Claim a fresh `pages`-page span from the pool-page allocator and
    /// slice it into the largest bucketable chunks it holds, pushing each
    /// onto its bucket. A tail smaller than one header-plus-slot is wasted
    /// rather than tracked -- the same bounded, one-time rounding loss every
    /// refill pays.
    fn refill(&mut self, pages: usize, tag: [u8; 4]) -> KernelResult<()> {
        let virt = crate::mm::pool_page::alloc_pool_span(pages, tag)?;
        let total = pages * PAGE_SIZE;
        let mut cursor = virt.as_u64() as *mut u8;
        let mut remaining = total;

        while remaining >= size_of::<BlockHeader>() + SLOT_SIZE {
            let max_payload = (remaining - size_of::<BlockHeader>()).min(SMALL_BLOCK_MAX_SLOTS * SLOT_SIZE);
            let slots = max_payload / SLOT_SIZE;
            if slots == 0 {
                break;
            }
            let consumed = size_of::<BlockHeader>() + slots * SLOT_SIZE;
            let header = cursor as *mut BlockHeader;
            // SAFETY: `cursor` addresses `consumed` freshly claimed bytes
            // within the span just allocated above.
            unsafe {
                header.write(BlockHeader {
                    link: ListLink::new(),
                    tag,
                    head_index: slots as u32,
                    pages: 0,
                    in_use: false,
                });
                self.free[slots - 1].push_back(NonNull::new_unchecked(header));
                cursor = cursor.add(consumed);
            }
            remaining -= consumed;
        }
        crate::mm::tag_tracker::record_alloc(tag, total - remaining);
        Ok(())
    }

    /// Allocate `size` bytes tagged `tag`. Requests needing more than
    /// `SMALL_BLOCK_MAX_SLOTS` slots bypass the buckets entirely and go
    /// straight to a dedicated page-backed allocation.
    pub fn alloc(&mut self, size: usize, tag: [u8; 4]) -> KernelResult<NonNull<u8>> {
        if size == 0 {
            return Err(KernelError::InvalidArgument { name: "size", value: "must be > 0" });
        }
        let slots = size.div_ceil(SLOT_SIZE).max(1);
        if slots > SMALL_BLOCK_MAX_SLOTS {
            return self.alloc_large(size, tag);
        }

        if let Some(block) = self.find_or_split(slots) {
            return Ok(self.claim(block, tag));
        }

        self.refill(crate::mm::pool_page::MAX_SPAN, *b"Pool")?;
        let block = self
            .find_or_split(slots)
            .ok_or(KernelError::Memory(MmError::OutOfMemory { requested: slots * SLOT_SIZE, available: 0 }))?;
        Ok(self.claim(block, tag))
    }

    fn claim(&mut self, mut block: NonNull<BlockHeader>, tag: [u8; 4]) -> NonNull<u8> {
        // SAFETY: `block` just came off a free bucket (now unlinked) and is
        // a valid, uniquely-owned header.
        unsafe {
            block.as_mut().in_use = true;
            block.as_mut().tag = tag;
            let granted = block.as_ref().payload_size();
            crate::mm::tag_tracker::record_alloc(tag, granted);
            NonNull::new_unchecked(BlockHeader::payload_ptr(block))
        }
    }

    /// Scan buckets from `slots` upward; on a larger match, split off the
    /// remainder into its own bucket when it is big enough to host a header
    /// and at least one slot, otherwise hand over the whole block.
    fn find_or_split(&mut self, slots: usize) -> Option<NonNull<BlockHeader>> {
        for bucket_slots in slots..=SMALL_BLOCK_MAX_SLOTS {
            let idx = bucket_slots - 1;
            let Some(block) = self.free[idx].pop_front() else { continue };
            if bucket_slots == slots {
                return Some(block);
            }

            // SAFETY: `block` was just unlinked from its bucket; we have
            // exclusive access to it and the raw bytes following its header.
            unsafe {
                let extra_bytes = (bucket_slots - slots) * SLOT_SIZE;
                if extra_bytes >= size_of::<BlockHeader>() + SLOT_SIZE {
                    let remainder_payload = extra_bytes - size_of::<BlockHeader>();
                    let remainder_slots = remainder_payload / SLOT_SIZE;
                    let remainder_ptr =
                        BlockHeader::payload_ptr(block).add(slots * SLOT_SIZE) as *mut BlockHeader;
                    remainder_ptr.write(BlockHeader {
                        link: ListLink::new(),
                        tag: *b"Pool",
                        head_index: remainder_slots as u32,
                        pages: 0,
                        in_use: false,
                    });
                    self.free[remainder_slots - 1].push_back(NonNull::new_unchecked(remainder_ptr));
                    (*block.as_ptr()).head_index = slots as u32;
                }
                // else: remainder too small to host its own header; the
                // caller gets the whole oversized block instead.
            }
            return Some(block);
        }
        None
    }

    fn alloc_large(&mut self, size: usize, tag: [u8; 4]) -> KernelResult<NonNull<u8>> {
        let total = size + size_of::<BlockHeader>();
        let pages = total.div_ceil(PAGE_SIZE);
        let virt = crate::mm::pool_page::alloc_pool_span_large(pages, tag)?;
        let header = virt.as_u64() as *mut BlockHeader;
        // SAFETY: `virt` addresses `pages * PAGE_SIZE` freshly claimed bytes.
        unsafe {
            header.write(BlockHeader {
                link: ListLink::new(),
                tag,
                head_index: 0,
                pages: pages as u32,
                in_use: true,
            });
        }
        let granted = pages * PAGE_SIZE - size_of::<BlockHeader>();
        crate::mm::tag_tracker::record_alloc(tag, granted);
        // SAFETY: header is valid, immediately followed by its payload.
        Ok(unsafe { NonNull::new_unchecked(BlockHeader::payload_ptr(NonNull::new_unchecked(header))) })
    }

    /// Free a previously allocated block.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior call to [`Pool::alloc`] on
    /// this pool and not already freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let mut header = BlockHeader::from_payload(ptr.as_ptr());
        let tag = header.as_ref().tag;
        let granted = header.as_ref().payload_size();
        header.as_mut().in_use = false;
        crate::mm::tag_tracker::record_free(tag, granted);

        if header.as_ref().pages > 0 {
            // Solo-span block: this is the only allocation on its
            // pool-page span, so the whole span becomes free the moment
            // this block does. Release it all the way back (PFN clear,
            // unmap, bitmap clear) instead of parking it on a free list
            // forever.
            let pages = header.as_ref().pages as usize;
            let virt = VirtualAddress::new(header.as_ptr() as u64);
            let _ = crate::mm::pool_page::free_pool_span_large(virt, pages);
            return;
        }

        let slots = header.as_ref().head_index as usize;
        self.free[slots - 1].push_back(header);
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

static POOL: SpinLock<Pool> = SpinLock::new(Pool::new());

pub fn init() -> KernelResult<()> {
    POOL.lock().bootstrap()
}

pub fn alloc(size: usize, tag: [u8; 4]) -> KernelResult<NonNull<u8>> {
    POOL.lock().alloc(size, tag)
}

/// # Safety
/// See [`Pool::free`].
pub unsafe fn free(ptr: NonNull<u8>) {
    POOL.lock().free(ptr)
}

/// `GlobalAlloc` adapter so the pool can back `#[global_allocator]`.
pub struct PoolHeap;

// SAFETY: `alloc`/`dealloc` forward to `Pool::alloc`/`Pool::free`, which
// uphold `GlobalAlloc`'s contract: returned memory is at least `layout`-sized
// and valid until freed through the same pool.
unsafe impl core::alloc::GlobalAlloc for PoolHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self::alloc(layout.size().max(layout.align()), *b"Heap") {
            Ok(p) => p.as_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            self::free(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn bucket_index_matches_head_index_minus_one() {
        // `head_index` values are 1-based slot counts; bucket storage is
        // 0-based. slots=1 lives in free[0], slots=255 in free[254].
        assert_eq!(1usize.saturating_sub(1), 0);
        assert_eq!(SMALL_BLOCK_MAX_SLOTS - 1, 254);
    }

    #[test_case]
    fn payload_size_rounds_to_slot_granularity() {
        let h = BlockHeader { link: ListLink::new(), tag: *b"Test", head_index: 3, pages: 0, in_use: true };
        assert_eq!(h.payload_size(), 48);
    }

    #[test_case]
    fn solo_span_payload_size_is_span_minus_header() {
        let h = BlockHeader { link: ListLink::new(), tag: *b"Test", head_index: 0, pages: 2, in_use: true };
        assert_eq!(h.payload_size(), 2 * PAGE_SIZE - size_of::<BlockHeader>());
    }
}
