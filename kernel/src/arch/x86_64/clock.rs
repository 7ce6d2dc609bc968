//! L11: timer source selection.
//!
//! Picks the invariant TSC when the CPU advertises it, else falls back to
//! the HPET (its register block mapped uncached through `msr::phys_to_virt`,
//! a 32-bit counter widened to 64 bits by a software overflow counter driven
//! from the clock interrupt). Exposes [`frequency`] in Hz and [`ticks`] as a
//! monotonic 64-bit count, and calibrates the local APIC timer's periodic
//! interval against whichever source won, averaged over five ~1ms windows.
//!
//! TSC frequency calibration is grounded in the classic PIT-channel-2
//! polled-readback technique: channel 2 is gated through port 0x61 rather
//! than routed through an IRQ, so it works identically whether or not the
//! I/O APIC has finished routing legacy IRQ0 yet.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch::x86_64::{apic, msr};
use crate::error::{KernelError, KernelResult};

const PIT_FREQUENCY: u64 = 1_193_182;
const PIT_CMD: u16 = 0x43;
const PIT_CHANNEL2_DATA: u16 = 0x42;
const PIT_GATE_PORT: u16 = 0x61;

/// HPET register offsets (byte offsets from the HPET base address).
const HPET_REG_CAPABILITIES: usize = 0x000;
const HPET_REG_CONFIG: usize = 0x010;
const HPET_REG_COUNTER: usize = 0x0F0;

const HPET_CAP_COUNTER_SIZE_BIT: u64 = 1 << 13;
const HPET_CFG_ENABLE_BIT: u64 = 1 << 0;

/// Which tick source `ticks()`/`frequency()` are currently backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Invariant time-stamp counter, read directly with `rdtsc`.
    Tsc,
    /// High Precision Event Timer, mapped uncached.
    Hpet,
}

static ACTIVE_SOURCE: AtomicU32 = AtomicU32::new(0); // 0 = unset, 1 = Tsc, 2 = Hpet
static FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);

static HPET_BASE: AtomicU64 = AtomicU64::new(0);
static HPET_WIDTH_32: AtomicBool = AtomicBool::new(false);
/// Software-maintained high half for 32-bit HPET counters, advanced by
/// [`poll_hpet_overflow`] from the clock-tick handler.
static HPET_HIGH: AtomicU32 = AtomicU32::new(0);
static HPET_LOW_SEEN: AtomicU32 = AtomicU32::new(0);

/// Scheduler tick rate the boot CPU calibrated its APIC timer to, so every
/// AP arms its own local APIC at the same rate without re-reading config.
static TICK_HZ: AtomicU32 = AtomicU32::new(100);

#[inline(always)]
fn rdtsc() -> u64 {
    // SAFETY: RDTSC has no side effects and is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// CPUID leaf 0x8000_0007, EDX bit 8: invariant TSC (runs at a constant rate
/// across P-states/C-states and is synchronized across cores).
fn has_invariant_tsc() -> bool {
    // SAFETY: CPUID is always available in long mode; leaf 0x80000007 is
    // defined on every CPU that implements extended leaves (we only use the
    // result as an optimization hint, never as a safety precondition).
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) };
    if leaf.eax < 0x8000_0007 {
        return false;
    }
    let features = unsafe { core::arch::x86_64::__cpuid(0x8000_0007) };
    features.edx & (1 << 8) != 0
}

/// Calibrate the TSC's frequency against PIT channel 2, gated through port
/// 0x61 so it needs neither IRQ delivery nor the I/O APIC to be routed yet.
fn calibrate_tsc() -> u64 {
    // SAFETY: port 0x61 and the PIT command/data ports are fixed, always
    // present legacy I/O addresses; this sequence only reprograms channel 2,
    // which nothing else in this kernel drives.
    unsafe {
        let gate_saved = crate::arch::x86_64::inb(PIT_GATE_PORT);

        // Gate off, speaker off, before reprogramming the channel.
        crate::arch::x86_64::outb(PIT_GATE_PORT, gate_saved & 0xFC);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        crate::arch::x86_64::outb(PIT_CMD, 0xB0);
        crate::arch::x86_64::outb(PIT_CHANNEL2_DATA, 0xFF);
        crate::arch::x86_64::outb(PIT_CHANNEL2_DATA, 0xFF);

        // Gate on (rising edge loads the count and starts it), speaker off.
        crate::arch::x86_64::outb(PIT_GATE_PORT, (crate::arch::x86_64::inb(PIT_GATE_PORT) | 0x01) & !0x02);

        let start = rdtsc();
        // OUT2 (bit 5 of port 0x61) is low while counting, high at terminal count.
        while crate::arch::x86_64::inb(PIT_GATE_PORT) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let end = rdtsc();

        crate::arch::x86_64::outb(PIT_GATE_PORT, gate_saved);

        let delta = end - start;
        delta * PIT_FREQUENCY / 0xFFFF
    }
}

/// Find and initialize the HPET as a fallback tick source. Returns its
/// frequency in Hz.
fn init_hpet() -> KernelResult<u64> {
    let (table_vaddr, _len) = crate::arch::x86_64::acpi::find_hpet()
        .ok_or(KernelError::NotFound { resource: "HPET ACPI table", id: 0 })?;

    // The HPET ACPI table's register-block base address sits at a fixed
    // offset (0x2C) inside the table, as a 12-byte Generic Address
    // Structure whose low 8 bytes are the 64-bit physical address.
    const HPET_GAS_ADDRESS_OFFSET: usize = 0x2C;
    // SAFETY: `table_vaddr` was captured by `acpi::find_hpet` from a
    // validated ACPI table mapped for the kernel's lifetime.
    let hpet_phys = unsafe {
        core::ptr::read_unaligned((table_vaddr as usize + HPET_GAS_ADDRESS_OFFSET) as *const u64)
    };

    let virt = msr::phys_to_virt(hpet_phys as usize)
        .ok_or(KernelError::Memory(crate::error::MmError::InvalidAddress { addr: hpet_phys as usize }))?;

    // SAFETY: `virt` points at the HPET's memory-mapped register block,
    // identity/offset-mapped by the bootloader and marked uncacheable by
    // firmware per the ACPI spec for this region.
    let caps = unsafe { core::ptr::read_volatile((virt + HPET_REG_CAPABILITIES) as *const u64) };
    let period_fs = caps >> 32; // counter tick period, in femtoseconds
    if period_fs == 0 {
        return Err(KernelError::HardwareError { device: "HPET", code: 0 });
    }
    let frequency = 1_000_000_000_000_000u64 / period_fs;
    let width_32 = caps & HPET_CAP_COUNTER_SIZE_BIT == 0;

    // SAFETY: disabling then re-enabling the main counter is the documented
    // HPET bring-up sequence; no other code touches this register block.
    unsafe {
        let cfg = core::ptr::read_volatile((virt + HPET_REG_CONFIG) as *const u64);
        core::ptr::write_volatile((virt + HPET_REG_CONFIG) as *mut u64, cfg & !HPET_CFG_ENABLE_BIT);
        core::ptr::write_volatile((virt + HPET_REG_COUNTER) as *mut u64, 0);
        core::ptr::write_volatile((virt + HPET_REG_CONFIG) as *mut u64, cfg | HPET_CFG_ENABLE_BIT);
    }

    HPET_BASE.store(virt as u64, Ordering::Release);
    HPET_WIDTH_32.store(width_32, Ordering::Release);
    log::info!(
        "[CLOCK] HPET at phys {:#x}, {}-bit, {} Hz",
        hpet_phys,
        if width_32 { 32 } else { 64 },
        frequency
    );
    Ok(frequency)
}

/// Select and initialize the timer source: invariant TSC if the CPU
/// advertises it, else HPET. Must be called once, on the boot CPU, after
/// ACPI tables have been parsed.
pub fn init() -> KernelResult<()> {
    if has_invariant_tsc() {
        let hz = calibrate_tsc();
        FREQUENCY_HZ.store(hz, Ordering::Release);
        ACTIVE_SOURCE.store(1, Ordering::Release);
        log::info!(
            "[CLOCK] using TSC as timer source ({}.{:02} MHz)",
            hz / 1_000_000,
            (hz % 1_000_000) / 10_000
        );
        return Ok(());
    }

    log::warn!("[CLOCK] no invariant TSC, falling back to HPET");
    let hz = init_hpet()?;
    FREQUENCY_HZ.store(hz, Ordering::Release);
    ACTIVE_SOURCE.store(2, Ordering::Release);
    Ok(())
}

/// Current tick source, or `None` before [`init`] has run.
pub fn active_source() -> Option<Source> {
    match ACTIVE_SOURCE.load(Ordering::Acquire) {
        1 => Some(Source::Tsc),
        2 => Some(Source::Hpet),
        _ => None,
    }
}

/// Tick source frequency in Hz. Zero before [`init`] has run.
pub fn frequency() -> u64 {
    FREQUENCY_HZ.load(Ordering::Acquire)
}

/// Monotonic tick count since [`init`]. Divide by [`frequency`] for seconds.
pub fn ticks() -> u64 {
    match ACTIVE_SOURCE.load(Ordering::Acquire) {
        1 => rdtsc(),
        2 => hpet_ticks(),
        _ => 0,
    }
}

fn hpet_ticks() -> u64 {
    let base = HPET_BASE.load(Ordering::Acquire) as usize;
    if base == 0 {
        return 0;
    }
    // SAFETY: `base` was published by `init_hpet` after a successful mapping
    // and is never unmapped for the kernel's lifetime.
    let low = unsafe { core::ptr::read_volatile((base + HPET_REG_COUNTER) as *const u32) };
    if !HPET_WIDTH_32.load(Ordering::Acquire) {
        // SAFETY: same register block, reading the full 64-bit counter.
        return unsafe { core::ptr::read_volatile((base + HPET_REG_COUNTER) as *const u64) };
    }
    (HPET_HIGH.load(Ordering::Acquire) as u64) << 32 | low as u64
}

/// Advance the software overflow counter for a 32-bit HPET. Called once per
/// clock tick, only meaningful when HPET is active and narrow; a no-op
/// otherwise. Must only be called from the boot CPU's tick handler.
pub fn poll_hpet_overflow() {
    if ACTIVE_SOURCE.load(Ordering::Relaxed) != 2 || !HPET_WIDTH_32.load(Ordering::Relaxed) {
        return;
    }
    let base = HPET_BASE.load(Ordering::Relaxed) as usize;
    // SAFETY: see `hpet_ticks`.
    let current = unsafe { core::ptr::read_volatile((base + HPET_REG_COUNTER) as *const u32) };
    let prev = HPET_LOW_SEEN.swap(current, Ordering::Relaxed);
    if current < prev {
        HPET_HIGH.fetch_add(1, Ordering::Relaxed);
    }
}

/// Calibrate and arm this CPU's local APIC timer for periodic ticks at
/// `hz`, averaging the initial count over five ~1ms windows against
/// whichever tick source [`init`] selected.
///
/// Must be called after [`init`] (on the boot CPU) or after the tick source
/// is already active (on every AP, which reuses the boot CPU's calibration
/// target but still measures its own local APIC's count rate).
pub fn calibrate_apic_timer(vector: u8, hz: u32) -> KernelResult<()> {
    TICK_HZ.store(hz, Ordering::Relaxed);
    let source_hz = frequency();
    if source_hz == 0 {
        return Err(KernelError::NotInitialized { subsystem: "clock" });
    }
    let window_ticks = source_hz / 1000; // ~1ms of tick-source time

    let mut accum: u64 = 0;
    for _ in 0..5 {
        let target = ticks() + window_ticks;
        apic::setup_timer(vector, 0x0B, u32::MAX)?; // divide-by-1, free-run
        while ticks() < target {
            core::hint::spin_loop();
        }
        let remaining = apic::read_timer_count();
        accum += (u32::MAX - remaining) as u64;
    }
    let initial_count = (accum / 5).max(1) as u32;
    let divide = 0x0B; // divide-by-1
    let reload = initial_count.saturating_mul(1000 / hz.max(1));
    apic::setup_timer(vector, divide, reload)?;
    log::info!("[CLOCK] APIC timer armed for {} Hz (initial count {})", hz, reload);
    Ok(())
}

/// The tick rate the boot CPU last calibrated its APIC timer to. Used by
/// `cpu::smp::ap_main` so every AP arms its local APIC at the same rate.
pub fn configured_tick_hz() -> u32 {
    TICK_HZ.load(Ordering::Relaxed)
}
