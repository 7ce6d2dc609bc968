//! Address and page-size types shared across the memory manager.

/// Native page size on this platform.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Frame number this address falls within.
    pub fn frame(&self) -> FrameNumber {
        FrameNumber(self.0 >> PAGE_SHIFT)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

/// Physical frame number (physical address >> 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn to_phys(&self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

pub const FRAME_SIZE: usize = PAGE_SIZE;

/// A contiguous physical memory region, as reported by the loader's memory
/// map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub len: u64,
    pub usable: bool,
}

impl MemoryRegion {
    pub fn end(&self) -> PhysicalAddress {
        PhysicalAddress(self.start.0 + self.len)
    }

    pub fn frame_count(&self) -> u64 {
        self.len / PAGE_SIZE as u64
    }
}

bitflags::bitflags! {
    /// Page table entry permission/attribute flags, architecture-neutral.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE     = 1 << 4;
        const ACCESSED     = 1 << 5;
        const DIRTY        = 1 << 6;
        const HUGE         = 1 << 7;
        const GLOBAL       = 1 << 8;
        const NO_EXECUTE   = 1 << 63;
    }
}

impl PageFlags {
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE);
    pub const KERNEL_CODE: Self = Self::PRESENT;
    pub const KERNEL_RODATA: Self = Self::PRESENT.union(Self::NO_EXECUTE);
}
