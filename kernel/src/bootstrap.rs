//! L17: kernel entry and boot phases.
//!
//! Orders every other component's bring-up on the boot CPU, then hands off
//! to the scheduler. Application processors take the parallel path in
//! `cpu::smp::ap_main`, which joins the same steady state (`scheduler::idle_loop`).
//!
//! Phase order: early console -> GDT/IDT -> logger -> memory map parse ->
//! `mm::init` -> SMP bring-up -> APIC/timer -> idle + boot threads ->
//! enter the scheduler. This mirrors the teacher's staged `kernel_init`,
//! narrowed to the subsystems this crate actually owns.

use bootloader_api::BootInfo;

use crate::arch::x86_64::{acpi, apic, boot, clock, gdt, idt};
use crate::config::BootConfig;
use crate::mm::types::{MemoryRegion, PhysicalAddress};

const MAX_BOOT_REGIONS: usize = 64;

/// Scratch space the boot-info memory map is copied into, in our own
/// `MemoryRegion` shape, before being handed to `mm::init` as a `'static`
/// slice. Filled once, by the boot CPU, before any other code can observe it.
static mut REGIONS: [MemoryRegion; MAX_BOOT_REGIONS] = [MemoryRegion {
    start: PhysicalAddress(0),
    len: 0,
    usable: false,
}; MAX_BOOT_REGIONS];

/// Sort `regions[..count]` by start address and merge adjacent descriptors
/// that agree on usability, returning the new, possibly-shrunk count.
///
/// Bootloaders routinely hand back a memory map fragmented along
/// implementation-specific boundaries (e.g. a "used" descriptor splitting
/// what is otherwise one contiguous free range). `pfn`'s coalescing free
/// list does not need these kept apart, and a finer map only costs extra
/// `MAX_BOOT_REGIONS` slots that firmware with a more fragmented map might
/// actually need.
fn coalesce_regions(regions: &mut [MemoryRegion]) -> usize {
    if regions.is_empty() {
        return 0;
    }

    regions.sort_unstable_by_key(|r| r.start.as_u64());

    let mut write = 0usize;
    for read in 1..regions.len() {
        let prev = regions[write];
        let cur = regions[read];
        let adjacent = prev.start.as_u64() + prev.len >= cur.start.as_u64();
        if adjacent && prev.usable == cur.usable {
            let end = (prev.start.as_u64() + prev.len).max(cur.start.as_u64() + cur.len);
            regions[write].len = end - prev.start.as_u64();
        } else {
            write += 1;
            regions[write] = cur;
        }
    }
    write + 1
}

fn convert_regions(boot_info: &BootInfo) -> &'static [MemoryRegion] {
    use bootloader_api::info::MemoryRegionKind;

    let mut count = 0usize;
    for region in boot_info.memory_regions.iter() {
        if count >= MAX_BOOT_REGIONS {
            log::warn!("boot: memory map truncated at {} regions", MAX_BOOT_REGIONS);
            break;
        }
        let usable = matches!(region.kind, MemoryRegionKind::Usable);
        // SAFETY: single-threaded boot, before any other CPU or interrupt
        // can observe `REGIONS`.
        unsafe {
            REGIONS[count] = MemoryRegion {
                start: PhysicalAddress(region.start),
                len: region.end - region.start,
                usable,
            };
        }
        count += 1;
    }
    // SAFETY: `count` entries were just written above, on this same thread;
    // coalescing only reorders/merges within that same prefix.
    unsafe {
        count = coalesce_regions(&mut REGIONS[..count]);
        &REGIONS[..count]
    }
}

/// Entry point reached once, from `main.rs`'s `entry_point!` trampoline.
/// Never returns: the boot thread becomes this CPU's initial running thread
/// and falls into the scheduler's steady state.
pub fn kernel_main(boot_info: &'static BootInfo) -> ! {
    // SAFETY: called once, before any other code touches `BOOT_INFO`.
    unsafe {
        boot::set(boot_info);
    }

    crate::arch::x86_64::early_serial::init();
    crate::logging::init(log::LevelFilter::Info);
    log::info!("veridian-kernel {} booting", env!("CARGO_PKG_VERSION"));

    gdt::init();
    idt::init();

    let config = BootConfig::load();
    log::set_max_level(config.log_level);

    crate::cpu::set_boot_cpu_id(0);

    let regions = convert_regions(boot_info);
    crate::mm::init(regions).expect("mm::init failed");

    if let Err(e) = acpi::init() {
        log::warn!("ACPI init failed ({e:?}), MADT/HPET unavailable");
    }

    if let Err(e) = apic::init() {
        log::warn!("APIC init failed ({e:?}), interrupts stay PIC-routed");
    }

    if let Err(e) = clock::init() {
        log::warn!("timer source init failed ({e:?}), clock ticks stay at 0");
    } else if apic::is_initialized() {
        if let Err(e) = clock::calibrate_apic_timer(idt::TIMER_VECTOR, 1000 / config.tick_ms.max(1)) {
            log::warn!("APIC timer calibration failed ({e:?}), falling back to legacy PIC timer");
        }
    }

    let online = crate::cpu::smp::bring_up_all(&config).unwrap_or(1);
    log::info!("{} CPU(s) online", online);

    let idle = spawn_idle_and_init();

    // SAFETY: this is the boot CPU's first and only thread so far; no
    // scheduling decision has run yet, so there is no prior "current" to
    // clobber. From here on the idle thread is a real scheduled thread like
    // any other, reached the first time by falling straight into its entry
    // rather than via `context_switch`.
    unsafe {
        crate::cpu::set_current_thread(idle);
        idle.get().state = crate::sched::thread::ThreadState::Running;
    }

    crate::intrinsics::enable_interrupts();

    crate::sched::scheduler::idle_loop(0)
}

/// Install CPU 0's idle thread and queue an initial kernel thread so the
/// scheduler has something to pick besides idle on the first tick. Returns
/// the idle thread so the caller can install it as "current" before falling
/// into `scheduler::idle_loop`.
fn spawn_idle_and_init() -> crate::sched::thread::ThreadPtr {
    let idle = crate::sched::thread::create_thread(idle_thread_entry, 0)
        .expect("idle thread allocation failed");
    crate::sched::scheduler::set_idle_thread(0, idle);

    crate::sched::spawn(init_thread_entry, 0).expect("initial thread spawn failed");
    idle
}

/// Entry for a CPU's idle thread object. Never returns: falls straight into
/// the scheduler's idle loop for this CPU.
extern "C" fn idle_thread_entry(cpu_id: usize) -> ! {
    crate::sched::scheduler::idle_loop(cpu_id as u32)
}

extern "C" fn init_thread_entry(_arg: usize) -> ! {
    log::info!("initial kernel thread running");
    crate::sched::exit_current()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, len: u64, usable: bool) -> MemoryRegion {
        MemoryRegion { start: PhysicalAddress(start), len, usable }
    }

    #[test]
    fn coalesce_merges_adjacent_free_regions() {
        let mut regions = [
            region(0, 64 * 1024, false),
            region(64 * 1024, 448 * 1024, true),
            region(512 * 1024, 512 * 1024, true),
        ];
        let count = coalesce_regions(&mut regions);
        assert_eq!(count, 2);
        assert_eq!(regions[0], region(0, 64 * 1024, false));
        assert_eq!(regions[1], region(64 * 1024, 960 * 1024, true));
    }

    #[test]
    fn coalesce_leaves_non_adjacent_regions_separate() {
        let mut regions = [region(0, 4096, true), region(8192, 4096, true)];
        let count = coalesce_regions(&mut regions);
        assert_eq!(count, 2);
        assert_eq!(regions[0], region(0, 4096, true));
        assert_eq!(regions[1], region(8192, 4096, true));
    }

    #[test]
    fn coalesce_keeps_differing_usability_apart() {
        let mut regions = [region(0, 4096, true), region(4096, 4096, false)];
        let count = coalesce_regions(&mut regions);
        assert_eq!(count, 2);
        assert_eq!(regions[0], region(0, 4096, true));
        assert_eq!(regions[1], region(4096, 4096, false));
    }

    #[test]
    fn coalesce_handles_empty_and_singleton() {
        let mut empty: [MemoryRegion; 0] = [];
        assert_eq!(coalesce_regions(&mut empty), 0);

        let mut one = [region(0, 4096, true)];
        assert_eq!(coalesce_regions(&mut one), 1);
    }
}
