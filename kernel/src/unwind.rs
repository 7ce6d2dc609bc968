//! Stack unwinding and symbolication for the panic path (§4.15 step 5).
//!
//! No DWARF/gimli in the teacher's dependency stack, so this walks frame
//! pointers rather than CFI: `rbp` chains through `push rbp; mov rbp, rsp`
//! prologues, which every function in this crate emits (frame pointers are
//! never omitted here). Each return address is matched against the loaded-
//! module list and printed as `<addr> - <image>!<symbol>+<offset>`, falling
//! back to a bare address when no module claims it.
//!
//! Restored from `KeFatalError`'s loop condition (§1B): the walk stops the
//! instant either the return address or the frame pointer itself leaves
//! kernel space, not just when the instruction pointer does -- a corrupted
//! `rbp` chasing into user space or a freed stack is exactly the condition
//! this guards against.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Canonical split between user and kernel address space on this platform's
/// 4-level paging layout.
const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

const MAX_FRAMES: usize = 32;
const MAX_MODULES: usize = 16;

#[derive(Clone, Copy)]
struct ModuleInfo {
    name: [u8; 32],
    name_len: usize,
    base: u64,
    size: u64,
}

impl ModuleInfo {
    const fn empty() -> Self {
        Self { name: [0; 32], name_len: 0, base: 0, size: 0 }
    }

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }
}

static MODULES: [spin_cell::Cell<ModuleInfo>; MAX_MODULES] =
    [spin_cell::Cell::new(ModuleInfo::empty()); MAX_MODULES];
static MODULE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A tiny single-writer-at-a-time cell: modules are registered once each
/// during L17 boot (image loading), then only ever read by the panic path.
/// Avoids pulling `SpinLock` (and its IRQL side effects) into the one code
/// path that must never itself fault.
mod spin_cell {
    use core::cell::UnsafeCell;

    pub struct Cell<T>(UnsafeCell<T>);

    impl<T: Copy> Cell<T> {
        pub const fn new(v: T) -> Self {
            Self(UnsafeCell::new(v))
        }

        pub fn get(&self) -> T {
            // SAFETY: written only by `register_module` during single-threaded
            // boot, read afterward only by the panic path, which runs with
            // every other CPU frozen.
            unsafe { *self.0.get() }
        }

        pub fn set(&self, v: T) {
            unsafe { *self.0.get() = v };
        }
    }

    // SAFETY: see `get`/`set` -- disjoint-in-time access only.
    unsafe impl<T> Sync for Cell<T> {}
}

/// Register a loaded kernel module's image range for backtrace symbolication.
/// Called once per module during L17 image loading.
pub fn register_module(name: &str, base: u64, size: u64) {
    let idx = MODULE_COUNT.fetch_add(1, Ordering::AcqRel);
    if idx >= MAX_MODULES {
        return;
    }
    let mut info = ModuleInfo::empty();
    let len = name.len().min(info.name.len());
    info.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    info.name_len = len;
    info.base = base;
    info.size = size;
    MODULES[idx].set(info);
}

fn find_module(addr: u64) -> Option<ModuleInfo> {
    let count = MODULE_COUNT.load(Ordering::Acquire).min(MAX_MODULES);
    MODULES[..count].iter().map(|c| c.get()).find(|m| addr >= m.base && addr < m.base + m.size)
}

/// Walk the current frame-pointer chain and print each return address,
/// stopping at the kernel/user boundary on either `rip` or `rsp`, or after
/// `MAX_FRAMES` entries (a runaway guard against a corrupted chain).
///
/// Called only from `panic::fatal_error`, after every other CPU has been
/// frozen and the console claimed.
pub fn print_backtrace() {
    serial_println!("*** Backtrace:");

    let mut rbp: u64;
    // SAFETY: reading the current frame pointer is always valid.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp);
    }

    for frame in 0..MAX_FRAMES {
        if rbp < KERNEL_SPACE_START {
            break;
        }
        // SAFETY: `rbp` was just checked to sit in kernel space; the frame
        // pointer chain is read-only here, and every other CPU is frozen so
        // nothing is concurrently unmapping this stack.
        let (saved_rbp, return_addr) = unsafe {
            let frame_ptr = rbp as *const u64;
            (frame_ptr.read_volatile(), frame_ptr.add(1).read_volatile())
        };

        if return_addr < KERNEL_SPACE_START {
            break;
        }

        match find_module(return_addr) {
            Some(module) => {
                serial_println!(
                    "  #{:<2} {:#018x} - {}!+{:#x}",
                    frame,
                    return_addr,
                    module.name_str(),
                    return_addr - module.base
                );
            }
            None => {
                serial_println!("  #{:<2} {:#018x} - <unknown>", frame, return_addr);
            }
        }

        if saved_rbp <= rbp {
            // A frame pointer must strictly increase up the stack; anything
            // else is a corrupted chain, not a legitimate caller.
            break;
        }
        rbp = saved_rbp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn module_lookup_respects_bounds() {
        register_module("test_mod", 0x1000, 0x100);
        assert!(find_module(0x1050).is_some());
        assert!(find_module(0x2000).is_none());
    }
}
