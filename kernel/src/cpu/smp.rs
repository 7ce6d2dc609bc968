//! SMP bring-up: discover application processors via ACPI and start them
//! with the INIT-SIPI-SIPI sequence.
//!
//! Grounded in `arch::x86_64::acpi::find_madt_cpus` for CPU discovery and
//! `arch::x86_64::apic::LocalApic::send_ipi` for IPI delivery; the trampoline
//! itself lives in `arch::x86_64::trampoline`.
//!
//! # Known limitation
//! `arch::x86_64::gdt` currently builds one static TSS shared by every CPU.
//! Real multi-CPU operation needs a private TSS (and therefore a private
//! `RSP0`) per AP; until that lands, APs share the boot CPU's TSS, which is
//! safe only because this kernel does not yet take user-mode faults on an
//! AP. Tracked as a follow-up in DESIGN.md.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use crate::arch::x86_64::{apic, trampoline};
use crate::error::{KernelError, KernelResult, SchedError};

const STARTUP_POLL_ITERS: u32 = 10_000_000;

/// Maps LAPIC ID -> logical CPU ID, filled in during `bring_up_all`.
static LAPIC_TO_CPU: [AtomicU32; super::MAX_CPUS] = {
    const INIT: AtomicU32 = AtomicU32::new(u32::MAX);
    [INIT; super::MAX_CPUS]
};

pub fn lapic_id_to_cpu_id(lapic_id: u32) -> Option<u32> {
    LAPIC_TO_CPU
        .iter()
        .position(|slot| slot.load(Ordering::Relaxed) == lapic_id)
        .map(|i| i as u32)
}

/// Discover CPUs via ACPI and start every AP. The boot CPU (whichever one
/// calls this) is registered as logical CPU 0.
pub fn bring_up_all(config: &crate::config::BootConfig) -> KernelResult<u32> {
    let boot_lapic_id = apic::read_id().unwrap_or(0) as u32;
    LAPIC_TO_CPU[0].store(boot_lapic_id, Ordering::Relaxed);
    super::set_boot_cpu_id(0);
    super::mark_online(0, boot_lapic_id);

    if config.smp_disabled {
        log::info!("SMP bring-up skipped (nosmp=1)");
        return Ok(1);
    }

    let Some(cpus) = crate::arch::x86_64::acpi::find_madt_cpus() else {
        log::warn!("no MADT CPU entries found, running uniprocessor");
        return Ok(1);
    };

    let limit = if config.max_cpus == 0 {
        super::MAX_CPUS as u32
    } else {
        config.max_cpus
    };

    let mut next_cpu_id = 1u32;
    for (_acpi_id, lapic_id, usable) in cpus {
        if !usable || lapic_id == boot_lapic_id {
            continue;
        }
        if next_cpu_id >= limit || (next_cpu_id as usize) >= super::MAX_CPUS {
            break;
        }
        let cpu_id = next_cpu_id;
        next_cpu_id += 1;
        LAPIC_TO_CPU[cpu_id as usize].store(lapic_id, Ordering::Relaxed);
        start_ap(cpu_id, lapic_id)?;
    }

    Ok(next_cpu_id)
}

fn start_ap(cpu_id: u32, lapic_id: u32) -> KernelResult<()> {
    // SAFETY: copying the trampoline blob into low, identity/offset-mapped
    // memory below 1 MiB; this region is reserved for this purpose and not
    // used by anything else during boot.
    unsafe {
        let dst = crate::arch::x86_64::msr::phys_to_virt(trampoline::TRAMPOLINE_ADDR as usize)
            .ok_or(KernelError::Memory(crate::error::MmError::InvalidAddress {
                addr: trampoline::TRAMPOLINE_ADDR as usize,
            }))? as *mut u8;
        core::ptr::copy_nonoverlapping(
            trampoline::trampoline_start_ptr(),
            dst,
            trampoline::trampoline_len(),
        );

        let data = dst.add(trampoline::trampoline_len() - 32) as *mut trampoline::TrampolineData;
        let stack = crate::mm::kstack::alloc_kernel_stack()?;
        let mut cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3);
        (*data).page_table = cr3;
        (*data).stack_top = stack.as_u64();
        (*data).entry = trampoline::ap_rust_entry as usize as u64;
        (*data).cpu_id = cpu_id;
    }

    apic::send_ipi(lapic_id as u8, 0x00) // INIT (delivery mode encoded by send_ipi's caller contract)
        .map_err(|_| KernelError::Scheduler(SchedError::CpuOffline { cpu: cpu_id as usize }))?;
    busy_wait(Duration::from_millis(10));

    let sipi_vector = (trampoline::TRAMPOLINE_ADDR >> 12) as u8;
    for _ in 0..2 {
        apic::send_ipi(lapic_id as u8, sipi_vector)
            .map_err(|_| KernelError::Scheduler(SchedError::CpuOffline { cpu: cpu_id as usize }))?;
        busy_wait(Duration::from_micros(200));
    }

    for _ in 0..STARTUP_POLL_ITERS {
        if super::get(cpu_id).is_online() {
            log::info!("CPU {} online (LAPIC {})", cpu_id, lapic_id);
            return Ok(());
        }
        core::hint::spin_loop();
    }

    Err(KernelError::Timeout { operation: "AP startup", duration_ms: 1000 })
}

fn busy_wait(d: Duration) {
    // No calibrated delay loop yet; this is a coarse spin used only during
    // the single-threaded SMP bring-up window.
    let iters = d.as_nanos() as u64 * 3;
    for _ in 0..iters {
        core::hint::spin_loop();
    }
}

/// Entry point every AP reaches after the trampoline hands off to 64-bit
/// Rust code.
///
/// # Safety
/// Must only be called once, by the trampoline, for the CPU identified by
/// `cpu_id`.
pub unsafe fn ap_main(cpu_id: u32) -> ! {
    let lapic_id = LAPIC_TO_CPU[cpu_id as usize].load(Ordering::Relaxed);
    apic::init().ok();
    if let Err(e) = crate::arch::x86_64::clock::calibrate_apic_timer(
        crate::arch::x86_64::idt::TIMER_VECTOR,
        crate::arch::x86_64::clock::configured_tick_hz(),
    ) {
        log::warn!("CPU {cpu_id}: APIC timer calibration failed ({e:?})");
    }

    let idle = crate::sched::thread::create_thread(ap_idle_entry, cpu_id as usize)
        .expect("AP idle thread allocation failed");
    crate::sched::scheduler::set_idle_thread(cpu_id, idle);
    // SAFETY: this AP has no prior "current thread"; installing its idle
    // thread here is the first write, before it is marked online.
    unsafe {
        crate::cpu::set_current_thread(idle);
        idle.get().state = crate::sched::thread::ThreadState::Running;
    }

    super::mark_online(cpu_id, lapic_id);
    crate::intrinsics::enable_interrupts();
    crate::sched::scheduler::idle_loop(cpu_id)
}

extern "C" fn ap_idle_entry(cpu_id: usize) -> ! {
    crate::sched::scheduler::idle_loop(cpu_id as u32)
}

/// Broadcast an IPI to every online CPU except the caller, used by the
/// scheduler to poke a remote CPU into re-evaluating its ready queue.
pub fn notify_cpu(cpu_id: u32) -> KernelResult<()> {
    let lapic_id = LAPIC_TO_CPU[cpu_id as usize].load(Ordering::Relaxed);
    if lapic_id == u32::MAX {
        return Err(KernelError::Scheduler(SchedError::InvalidCpuId { cpu: cpu_id as usize }));
    }
    apic::send_ipi(lapic_id as u8, crate::arch::x86_64::idt::RESCHEDULE_VECTOR)
        .map_err(|_| KernelError::Scheduler(SchedError::CpuOffline { cpu: cpu_id as usize }))
}

/// Send the broadcast freeze IPI (§4.9, §4.15) to every other online CPU.
/// Called exactly once, by whichever CPU wins the `fatal_error` race; never
/// by anything else.
///
/// # Safety
/// Caller must hold the panic path's single-owner guarantee (`PANIC_IN_PROGRESS`
/// already claimed) so this never races a second broadcast.
pub unsafe fn broadcast_freeze() {
    let me = super::current_cpu_id();
    for cpu_id in 0..super::MAX_CPUS as u32 {
        if cpu_id == me || !super::get(cpu_id).is_online() {
            continue;
        }
        let lapic_id = LAPIC_TO_CPU[cpu_id as usize].load(Ordering::Relaxed);
        if lapic_id != u32::MAX {
            let _ = apic::send_ipi(lapic_id as u8, crate::arch::x86_64::idt::FREEZE_VECTOR);
        }
    }
}
