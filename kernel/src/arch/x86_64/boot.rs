//! Loader handoff state.
//!
//! `bootloader_api::entry_point!` (invoked from `main.rs`, the only place in
//! the crate that defines the `_start` symbol) hands us a `&'static BootInfo`
//! exactly once, before anything else runs. Everything that later needs the
//! physical-memory offset, RSDP address, or memory map (`msr::phys_to_virt`,
//! `acpi::init`, `bootstrap::kernel_main`) reads it back out of here.

use bootloader_api::BootInfo;

/// Written once by `bootstrap::kernel_main` at the very start of boot, before
/// any other CPU exists and before interrupts are enabled; read-only from
/// every other call site afterwards.
#[allow(static_mut_refs)]
pub static mut BOOT_INFO: Option<&'static BootInfo> = None;

/// Record the loader handoff block. Must be called exactly once, from the
/// entry point, before any other kernel code runs.
///
/// # Safety
/// Must only be called once, on the boot CPU, before any other CPU is woken
/// and before any code that might read `BOOT_INFO` concurrently starts.
pub unsafe fn set(info: &'static BootInfo) {
    BOOT_INFO = Some(info);
}
