//! Kernel stack cache.
//!
//! Every thread (`sched::thread`) and every AP brought up through
//! `cpu::smp::start_ap` needs a private kernel stack. Stacks are fixed-size
//! spans of pool pages, cached per-CPU the same way `mm::pool_page` caches
//! page spans, so that thread creation on the common path never touches the
//! global pool-page lock.
//!
//! # Known limitation
//! Stacks are not guard-paged: until `mm::vmm` grows an unmapped-guard-page
//! facility, a stack overflow corrupts the adjacent allocation rather than
//! faulting. Tracked as a follow-up in `DESIGN.md`.

use crate::error::KernelResult;
use crate::mm::types::{VirtualAddress, PAGE_SIZE};
use crate::sync::SpinLock;

/// Stack size in pages (16 KiB), matching the span cap in `mm::pool_page`.
pub const KSTACK_PAGES: usize = 4;
pub const KSTACK_SIZE: usize = KSTACK_PAGES * PAGE_SIZE;

const CACHE_CAPACITY: usize = 8;
const CACHE_LOW_WATERMARK: usize = 2;
const CACHE_HIGH_WATERMARK: usize = 6;
const CACHE_BATCH: usize = 4;

const KSTACK_TAG: [u8; 4] = *b"Kstk";

struct Cache {
    entries: [u64; CACHE_CAPACITY],
    len: usize,
}

impl Cache {
    const fn new() -> Self {
        Self { entries: [0; CACHE_CAPACITY], len: 0 }
    }

    fn push(&mut self, addr: VirtualAddress) -> bool {
        if self.len >= CACHE_CAPACITY {
            return false;
        }
        self.entries[self.len] = addr.as_u64();
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<VirtualAddress> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(VirtualAddress(self.entries[self.len]))
    }
}

/// Per-CPU kernel stack cache. One instance lives in each `cpu::PerCpu`.
pub struct KernelStackCache {
    cache: SpinLock<Cache>,
}

impl KernelStackCache {
    pub const fn new() -> Self {
        Self { cache: SpinLock::new(Cache::new()) }
    }

    fn alloc_virt(&self) -> KernelResult<VirtualAddress> {
        let mut cache = self.cache.lock();
        if cache.len < CACHE_LOW_WATERMARK {
            for _ in 0..CACHE_BATCH {
                match crate::mm::pool_page::alloc_pool_span(KSTACK_PAGES, KSTACK_TAG) {
                    Ok(span) => {
                        if !cache.push(span) {
                            crate::mm::pool_page::free_pool_span(span, KSTACK_PAGES).ok();
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        if let Some(span) = cache.pop() {
            return Ok(span);
        }
        drop(cache);
        crate::mm::pool_page::alloc_pool_span(KSTACK_PAGES, KSTACK_TAG)
    }

    fn free_virt(&self, span: VirtualAddress) -> KernelResult<()> {
        let mut cache = self.cache.lock();
        if cache.len >= CACHE_HIGH_WATERMARK {
            for _ in 0..CACHE_BATCH {
                if let Some(drained) = cache.pop() {
                    crate::mm::pool_page::free_pool_span(drained, KSTACK_PAGES)?;
                } else {
                    break;
                }
            }
        }
        if !cache.push(span) {
            drop(cache);
            crate::mm::pool_page::free_pool_span(span, KSTACK_PAGES)?;
        }
        Ok(())
    }
}

impl Default for KernelStackCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle-time trim hook (§4.6/§1B): if this CPU's cache sits above its soft
/// (low-water) threshold, give back half of it rather than waiting for the
/// high-water drain on the next `free_kernel_stack`. Run from the idle loop,
/// so it never competes with the allocation hot path for the cache lock.
pub fn idle_trim_hook(cpu_id: u32) {
    let cache = &crate::cpu::get(cpu_id).kstack_cache.cache;
    let mut guard = cache.lock();
    if guard.len <= CACHE_LOW_WATERMARK {
        return;
    }
    let target = guard.len / 2;
    while guard.len > target {
        let Some(span) = guard.pop() else { break };
        drop(guard);
        if crate::mm::pool_page::free_pool_span(span, KSTACK_PAGES).is_err() {
            break;
        }
        guard = cache.lock();
    }
}

/// Allocate a kernel stack on the current CPU's cache and return the
/// initial stack pointer (the top of the span, since x86 stacks grow down).
pub fn alloc_kernel_stack() -> KernelResult<VirtualAddress> {
    let base = crate::cpu::current().kstack_cache.alloc_virt()?;
    Ok(VirtualAddress::new(base.as_u64() + KSTACK_SIZE as u64))
}

/// Free a kernel stack previously returned by [`alloc_kernel_stack`].
///
/// # Safety
/// `top` must be the exact value returned by `alloc_kernel_stack`, and the
/// stack must no longer be in use by any thread.
pub unsafe fn free_kernel_stack(top: VirtualAddress) -> KernelResult<()> {
    let base = VirtualAddress::new(top.as_u64() - KSTACK_SIZE as u64);
    crate::cpu::current().kstack_cache.free_virt(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn cache_push_pop_respects_capacity() {
        let mut c = Cache::new();
        for i in 0..CACHE_CAPACITY {
            assert!(c.push(VirtualAddress::new(i as u64 * PAGE_SIZE as u64)));
        }
        assert!(!c.push(VirtualAddress::new(0xdead)));
        assert_eq!(c.len, CACHE_CAPACITY);
    }
}
