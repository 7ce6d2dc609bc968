//! Real-mode AP startup trampoline.
//!
//! The INIT-SIPI-SIPI sequence (`cpu::smp`) starts each application
//! processor at a 4 KiB-aligned physical address below 1 MiB, executing in
//! 16-bit real mode with CS set to that page's segment. This module holds
//! the stub that takes an AP from there to a 64-bit Rust function: flip on
//! protected mode with a scratch GDT, enable PAE and long mode, reuse the
//! BSP's page tables (CR3 is read from a fixed scratch slot the BSP fills in
//! before sending STARTUP), then far-jump into 64-bit code and call
//! [`ap_rust_entry`].
//!
//! The blob is assembled in place in the kernel image and copied to its
//! run address by `cpu::smp::start_ap` -- it cannot run where it's linked
//! because real mode can't address a 64-bit kernel's load address.

use core::arch::global_asm;

/// Physical address the trampoline is copied to and each AP starts at.
/// Must be below 1 MiB and 4 KiB-aligned, per the SIPI vector encoding
/// (vector = address >> 12).
pub const TRAMPOLINE_ADDR: u64 = 0x8000;

/// Scratch data the BSP fills in before sending STARTUP, read by the stub
/// while still in real mode. Laid out at a fixed offset from
/// `TRAMPOLINE_ADDR` that matches the `trampoline_data` label below.
#[repr(C)]
pub struct TrampolineData {
    /// CR3 value (PML4 physical address) the AP should load.
    pub page_table: u64,
    /// Stack pointer the AP should switch to before calling Rust code.
    pub stack_top: u64,
    /// Entry point (`ap_rust_entry`) to jump to once in long mode.
    pub entry: u64,
    /// Logical CPU ID this AP should report as, passed through in RDI.
    pub cpu_id: u32,
}

extern "C" {
    #[link_name = "ap_trampoline_start"]
    static TRAMPOLINE_START: u8;
    #[link_name = "ap_trampoline_end"]
    static TRAMPOLINE_END: u8;
}

/// Size in bytes of the trampoline code blob.
pub fn trampoline_len() -> usize {
    // SAFETY: both symbols are linker-provided addresses (not memory to
    // dereference); only their addresses are used.
    unsafe {
        (&TRAMPOLINE_END as *const u8 as usize) - (&TRAMPOLINE_START as *const u8 as usize)
    }
}

pub fn trampoline_start_ptr() -> *const u8 {
    // SAFETY: address-only use, see above.
    unsafe { &TRAMPOLINE_START as *const u8 }
}

/// Rust entry point reached by every AP once it's executing in 64-bit long
/// mode with a valid stack. Never returns.
///
/// # Safety
/// Must only be reached from the trampoline stub, with `cpu_id` matching
/// the slot this AP was started for and the stack pointer already switched
/// to that CPU's private stack.
#[no_mangle]
pub unsafe extern "C" fn ap_rust_entry(cpu_id: u32) -> ! {
    crate::cpu::smp::ap_main(cpu_id)
}

global_asm!(
    ".global ap_trampoline_start",
    ".global ap_trampoline_end",
    ".code16",
    "ap_trampoline_start:",
    "cli",
    "xor ax, ax",
    "mov ds, ax",
    "mov es, ax",
    // Load a minimal GDT (null, 32-bit code, 32-bit data) sufficient to
    // reach protected mode; `trampoline_gdt_ptr` is data appended below.
    "lgdtd cs:[trampoline_gdt_ptr - ap_trampoline_start]",
    "mov eax, cr0",
    "or eax, 1",
    "mov cr0, eax",
    "ljmp $0x08, $(pm32 - ap_trampoline_start)",
    ".code32",
    "pm32:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    // Enable PAE + load CR3 from the data block the BSP populated.
    "mov eax, cr4",
    "or eax, 1 << 5",
    "mov cr4, eax",
    "mov eax, [trampoline_data - ap_trampoline_start]", // page_table low
    "mov cr3, eax",
    // Set EFER.LME.
    "mov ecx, 0xC0000080",
    "rdmsr",
    "or eax, 1 << 8",
    "wrmsr",
    // Enable paging -> now in IA-32e compatibility mode.
    "mov eax, cr0",
    "or eax, 1 << 31",
    "mov cr0, eax",
    "ljmp $0x18, $(lm64 - ap_trampoline_start)",
    ".code64",
    "lm64:",
    "mov rsp, [trampoline_data + 8 - ap_trampoline_start]", // stack_top
    "mov rdi, [trampoline_data + 24 - ap_trampoline_start]", // cpu_id (zero-extended)
    "mov rax, [trampoline_data + 16 - ap_trampoline_start]", // entry
    "call rax",
    "hlt_loop:",
    "hlt",
    "jmp hlt_loop",
    ".align 8",
    "trampoline_gdt:",
    ".quad 0",
    ".quad 0x00CF9A000000FFFF", // 32-bit code
    ".quad 0x00CF92000000FFFF", // 32-bit data
    ".quad 0x00AF9A000000FFFF", // 64-bit code
    "trampoline_gdt_ptr:",
    ".word trampoline_gdt_ptr - trampoline_gdt - 1",
    ".long trampoline_gdt",
    ".align 8",
    "trampoline_data:",
    ".quad 0", // page_table
    ".quad 0", // stack_top
    ".quad 0", // entry
    ".quad 0", // cpu_id
    "ap_trampoline_end:",
);
