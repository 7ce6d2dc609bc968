//! Per-tag allocation accounting for the small-block pool.
//!
//! Every pool allocation carries a 4-byte tag (`b"Thrd"`, `b"Evnt"`, ...)
//! supplied by the caller; this module keeps a running count and byte total
//! per tag so `DESIGN.md`-style diagnostics (and tests) can answer "who is
//! using memory." Backed by a fixed-capacity table rather than a `Vec` --
//! the tracker is initialized before the pool it instruments has anywhere
//! else to put dynamic state, so it cannot itself depend on an allocator.
//!
//! Bootstrap wrinkle, restored from the original implementation: the pool
//! allocator's own bookkeeping allocation (the first block carved out of the
//! first pool page, used for the pool's internal free-list headers) is
//! tagged `b"Pool"` and recorded through this same path, rather than being
//! exempted from accounting -- the tracker ends up tracking the allocation
//! that the pool made to become able to track anything at all.

const MAX_TAGS: usize = 256;

#[derive(Clone, Copy)]
struct TagEntry {
    tag: [u8; 4],
    alloc_count: u64,
    free_count: u64,
    bytes_in_use: usize,
}

impl TagEntry {
    const fn empty() -> Self {
        Self { tag: [0; 4], alloc_count: 0, free_count: 0, bytes_in_use: 0 }
    }

    fn in_use(&self) -> bool {
        self.tag != [0; 4]
    }
}

pub struct TagTracker {
    entries: [TagEntry; MAX_TAGS],
}

impl TagTracker {
    pub const fn new() -> Self {
        Self { entries: [TagEntry::empty(); MAX_TAGS] }
    }

    fn find_or_insert(&mut self, tag: [u8; 4]) -> Option<&mut TagEntry> {
        if let Some(i) = self.entries.iter().position(|e| e.in_use() && e.tag == tag) {
            return Some(&mut self.entries[i]);
        }
        let slot = self.entries.iter().position(|e| !e.in_use())?;
        self.entries[slot] = TagEntry { tag, ..TagEntry::empty() };
        Some(&mut self.entries[slot])
    }

    pub fn record_alloc(&mut self, tag: [u8; 4], bytes: usize) {
        if let Some(e) = self.find_or_insert(tag) {
            e.alloc_count += 1;
            e.bytes_in_use += bytes;
        }
    }

    pub fn record_free(&mut self, tag: [u8; 4], bytes: usize) {
        if let Some(e) = self.find_or_insert(tag) {
            e.free_count += 1;
            e.bytes_in_use = e.bytes_in_use.saturating_sub(bytes);
        }
    }

    pub fn stats(&self, tag: [u8; 4]) -> Option<(u64, u64, usize)> {
        self.entries
            .iter()
            .find(|e| e.in_use() && e.tag == tag)
            .map(|e| (e.alloc_count, e.free_count, e.bytes_in_use))
    }

    pub fn active_tag_count(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use()).count()
    }
}

impl Default for TagTracker {
    fn default() -> Self {
        Self::new()
    }
}

static TRACKER: crate::sync::SpinLock<TagTracker> = crate::sync::SpinLock::new(TagTracker::new());

pub fn record_alloc(tag: [u8; 4], bytes: usize) {
    TRACKER.lock().record_alloc(tag, bytes);
}

pub fn record_free(tag: [u8; 4], bytes: usize) {
    TRACKER.lock().record_free(tag, bytes);
}

pub fn stats(tag: [u8; 4]) -> Option<(u64, u64, usize)> {
    TRACKER.lock().stats(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn tracks_pool_bootstrap_tag() {
        let mut t = TagTracker::new();
        t.record_alloc(*b"Pool", 64);
        let (allocs, frees, bytes) = t.stats(*b"Pool").unwrap();
        assert_eq!(allocs, 1);
        assert_eq!(frees, 0);
        assert_eq!(bytes, 64);
    }

    #[test_case]
    fn free_reduces_bytes_in_use() {
        let mut t = TagTracker::new();
        t.record_alloc(*b"Thrd", 128);
        t.record_free(*b"Thrd", 128);
        let (_, frees, bytes) = t.stats(*b"Thrd").unwrap();
        assert_eq!(frees, 1);
        assert_eq!(bytes, 0);
    }
}
