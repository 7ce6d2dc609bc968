//! Fatal-error path: contract violations and unrecoverable hardware
//! conditions never return through `KernelResult` -- they divert here.
//!
//! `fatal_error` freezes every other CPU, takes the console, prints
//! `*** STOP: <code-name>` with the four diagnostic parameters, then walks
//! the stack (`crate::unwind`) before halting forever. It is written to
//! never itself panic: the code-to-message lookup defensively clamps an
//! out-of-range code before indexing its static table.

use core::sync::atomic::{AtomicBool, Ordering};

/// Closed set of panic codes, restored from the original implementation's
/// `Messages[]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PanicCode {
    ManuallyInitiatedCrash = 0,
    IrqlNotLessOrEqual = 1,
    IrqlNotGreaterOrEqual = 2,
    IrqlNotDispatch = 3,
    IrqlNotEqual = 4,
    TrapNotHandled = 5,
    ExceptionNotHandled = 6,
    PageFaultNotHandled = 7,
    NmiHardwareFailure = 8,
    KernelInitializationFailure = 9,
    DriverInitializationFailure = 10,
    BadPfnHeader = 11,
    BadPoolHeader = 12,
    BadThreadState = 13,
    SpinLockAlreadyOwned = 14,
    SpinLockNotOwned = 15,
    MutexNotOwned = 16,
}

const PANIC_COUNT: u32 = 17;

const MESSAGES: [&str; PANIC_COUNT as usize] = [
    "MANUALLY_INITIATED_CRASH",
    "IRQL_NOT_LESS_OR_EQUAL",
    "IRQL_NOT_GREATER_OR_EQUAL",
    "IRQL_NOT_DISPATCH",
    "IRQL_NOT_EQUAL",
    "TRAP_NOT_HANDLED",
    "EXCEPTION_NOT_HANDLED",
    "PAGE_FAULT_NOT_HANDLED",
    "NMI_HARDWARE_FAILURE",
    "KERNEL_INITIALIZATION_FAILURE",
    "DRIVER_INITIALIZATION_FAILURE",
    "BAD_PFN_HEADER",
    "BAD_POOL_HEADER",
    "BAD_THREAD_STATE",
    "SPIN_LOCK_ALREADY_OWNED",
    "SPIN_LOCK_NOT_OWNED",
    "MUTEX_NOT_OWNED",
];

/// Render a (possibly out-of-range) raw code as its name, clamping to
/// `MANUALLY_INITIATED_CRASH` so this lookup itself cannot panic.
fn code_name(code: u32) -> &'static str {
    MESSAGES[if code < PANIC_COUNT { code as usize } else { PanicCode::ManuallyInitiatedCrash as usize }]
}

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// Enter the fatal-error path. Never returns.
pub fn fatal_error(code: PanicCode, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    crate::intrinsics::disable_interrupts();
    // Raise to MAX so nothing else on this CPU can preempt the panic path.
    let _ = crate::sync::raise_irql(crate::sync::Irql::High);

    if PANIC_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Another CPU already owns the panic; spin here forever rather than
        // racing it for the console.
        loop {
            crate::intrinsics::halt();
        }
    }

    // SAFETY: we hold PANIC_IN_PROGRESS; no other CPU proceeds past its own
    // freeze IPI until this one halts it.
    unsafe {
        crate::cpu::smp_broadcast_freeze();
    }

    let name = code_name(code as u32);
    serial_println!("*** STOP: {} ({:#x},{:#x},{:#x},{:#x})", name, p1, p2, p3, p4);

    crate::unwind::print_backtrace();

    loop {
        crate::intrinsics::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_code_clamps_to_manual_crash() {
        assert_eq!(code_name(9999), "MANUALLY_INITIATED_CRASH");
    }

    #[test]
    fn every_named_code_resolves() {
        assert_eq!(code_name(PanicCode::MutexNotOwned as u32), "MUTEX_NOT_OWNED");
        assert_eq!(code_name(PanicCode::BadPfnHeader as u32), "BAD_PFN_HEADER");
    }
}
