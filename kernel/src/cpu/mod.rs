//! Per-processor state.
//!
//! Every CPU in the system owns one [`PerCpu`] block, indexed by its logical
//! CPU ID. Until true per-CPU storage (a `gs`-relative segment, as the
//! teacher's single static TSS in `arch::x86_64::gdt` does not yet support)
//! lands, these blocks live in a fixed-size global array and are addressed
//! by ID rather than by a CPU-local register -- functionally equivalent for
//! a kernel that is not yet preemptible across a context switch boundary
//! inside the scheduler itself.

pub mod affinity;
pub mod smp;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::mm::kstack::KernelStackCache;
use crate::mm::pfn::SinglePageCache;
use crate::mm::pool_page::PerCpuPageCache;
use crate::sched::dpc::{Dpc, WorkItem};
use crate::sched::thread::{QueueTag, Thread, ThreadPtr};
use crate::sync::list::IntrusiveList;
use crate::sync::SpinLock;

/// Upper bound on logical CPUs this kernel supports. ACPI's MADT can report
/// more, but SMP bring-up (`cpu::smp`) caps at this for a fixed-size table.
pub const MAX_CPUS: usize = 32;

/// The three thread queues a CPU owns, bundled under one lock so that moving
/// a thread between them (e.g. wait -> ready on timeout) is atomic -- a
/// thread is never observably a member of two of these at once.
pub struct CpuQueues {
    pub ready: IntrusiveList<Thread, QueueTag>,
    pub wait: IntrusiveList<Thread, QueueTag>,
    pub termination: IntrusiveList<Thread, QueueTag>,
}

impl CpuQueues {
    const fn new() -> Self {
        Self { ready: IntrusiveList::new(), wait: IntrusiveList::new(), termination: IntrusiveList::new() }
    }
}

/// Per-processor control block.
pub struct PerCpu {
    pub cpu_id: u32,
    pub lapic_id: u32,
    pub online: AtomicBool,
    /// Single-frame cache local to this CPU (see `mm::pfn`).
    pub single_page_cache: SpinLock<SinglePageCache>,
    /// Page-pool cache local to this CPU (see `mm::pool_page`).
    pub page_cache: PerCpuPageCache,
    /// Kernel-stack cache local to this CPU (see `mm::kstack`).
    pub kstack_cache: KernelStackCache,
    /// Ready/wait/termination queues, moved between under one lock.
    pub queues: SpinLock<CpuQueues>,
    /// Dispatch-level callbacks deferred from high-IRQL interrupt context.
    pub dpc_queue: SpinLock<IntrusiveList<Dpc>>,
    /// Callbacks targeted at this specific CPU, drained alongside DPCs.
    pub work_queue: SpinLock<IntrusiveList<WorkItem>>,
    /// Monotonic tick count observed by this CPU's clock interrupt.
    pub ticks: AtomicU64,
    /// Currently running thread, if any.
    pub current_thread: core::cell::UnsafeCell<Option<ThreadPtr>>,
    /// Idle thread for this CPU, run when the ready queue is empty.
    pub idle_thread: core::cell::UnsafeCell<Option<ThreadPtr>>,
    /// This CPU's current IRQL (`sync::spinlock::Irql` as `u8`). Each CPU
    /// masks its own interrupts independently, so this cannot be a single
    /// shared value once more than one CPU is actually running.
    pub irql: AtomicU8,
}

// SAFETY: `current_thread`/`idle_thread` are only ever touched by the owning
// CPU at DISPATCH_LEVEL or above (scheduler code), which serializes access;
// cross-CPU reads go through dedicated atomics elsewhere (e.g. affinity).
unsafe impl Sync for PerCpu {}

impl PerCpu {
    const fn empty(cpu_id: u32) -> Self {
        Self {
            cpu_id,
            lapic_id: 0,
            online: AtomicBool::new(false),
            single_page_cache: SpinLock::new(SinglePageCache::new()),
            page_cache: PerCpuPageCache::new(),
            kstack_cache: KernelStackCache::new(),
            queues: SpinLock::new(CpuQueues::new()),
            dpc_queue: SpinLock::new(IntrusiveList::new()),
            work_queue: SpinLock::new(IntrusiveList::new()),
            ticks: AtomicU64::new(0),
            current_thread: core::cell::UnsafeCell::new(None),
            idle_thread: core::cell::UnsafeCell::new(None),
            irql: AtomicU8::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

const EMPTY: PerCpu = PerCpu::empty(0);
static PER_CPU: [PerCpu; MAX_CPUS] = [EMPTY; MAX_CPUS];

static BOOT_CPU_ID: AtomicU32 = AtomicU32::new(0);
static ONLINE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Current CPU's logical ID.
///
/// Until `gs`-relative per-CPU storage exists, this reads the Local APIC ID
/// directly and maps it through the table `smp` populated during bring-up.
pub fn current_cpu_id() -> u32 {
    crate::arch::x86_64::apic::read_id()
        .and_then(|id| smp::lapic_id_to_cpu_id(id as u32))
        .unwrap_or(BOOT_CPU_ID.load(Ordering::Relaxed))
}

pub fn get(cpu_id: u32) -> &'static PerCpu {
    &PER_CPU[cpu_id as usize]
}

pub fn current() -> &'static PerCpu {
    get(current_cpu_id())
}

/// Mark `cpu_id` as initialized and online; called once per CPU during
/// bring-up (boot CPU and each AP after it starts running kernel code).
pub fn mark_online(cpu_id: u32, lapic_id: u32) {
    // SAFETY: called once per CPU during single-threaded bring-up of that
    // CPU, before it is visible to the scheduler.
    let slot = &PER_CPU[cpu_id as usize];
    // lapic_id/cpu_id are set-once at bring-up; no concurrent writer exists
    // because each CPU only ever initializes its own slot.
    unsafe {
        let ptr = slot as *const PerCpu as *mut PerCpu;
        (*ptr).lapic_id = lapic_id;
    }
    slot.online.store(true, Ordering::Release);
    ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// The thread currently running on this CPU.
///
/// # Panics
/// Panics if called before the scheduler has switched in a first thread.
pub fn current_thread() -> ThreadPtr {
    // SAFETY: only ever mutated by the owning CPU while holding its
    // `queues` lock during a scheduling decision.
    unsafe { (*current().current_thread.get()).expect("no current thread set") }
}

/// Set the thread currently running on this CPU. Called only by the
/// scheduler immediately before and after `context_switch`.
///
/// # Safety
/// Must only be called by the owning CPU, with the CPU's `queues` lock held.
pub unsafe fn set_current_thread(thread: ThreadPtr) {
    *current().current_thread.get() = Some(thread);
}

/// Stop every other online CPU. Called exactly once, from `panic::fatal_error`.
///
/// # Safety
/// Caller must already own the fatal-error path's single-owner guarantee.
pub unsafe fn smp_broadcast_freeze() {
    smp::broadcast_freeze();
}

pub fn online_count() -> u32 {
    ONLINE_COUNT.load(Ordering::Relaxed)
}

pub fn set_boot_cpu_id(id: u32) {
    BOOT_CPU_ID.store(id, Ordering::Relaxed);
}
