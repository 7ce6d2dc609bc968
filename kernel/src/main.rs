//! Binary entry point. All real logic lives in the library crate
//! (`veridian_kernel`); this file only wires the bootloader's `entry_point!`
//! trampoline and the non-test panic handler to it.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use veridian_kernel::panic::{fatal_error, PanicCode};

entry_point!(kernel_entry);

fn kernel_entry(boot_info: &'static BootInfo) -> ! {
    veridian_kernel::bootstrap::kernel_main(boot_info)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    veridian_kernel::serial_println!("[KERNEL PANIC] {}", info);
    fatal_error(PanicCode::ManuallyInitiatedCrash, 0, 0, 0, 0)
}
