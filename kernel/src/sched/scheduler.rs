//! The scheduler core: ready-queue placement, the clock-tick handler, context
//! switching, and the idle loop.
//!
//! This is the one place that is allowed to move a thread between CPUs (via
//! `queue_thread`'s cross-CPU scan) and the only caller of
//! `thread::context_switch`. Everything else -- `event::wait_for_object`,
//! `mutex::acquire` -- calls into here rather than touching queues directly.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sched::dpc::{self, Dpc, WorkPriority};
use crate::sched::thread::{self, Thread, ThreadPtr, ThreadState};
use crate::sync::Irql;

/// Default quantum, restored from the original implementation's
/// `PSP_THREAD_QUANTUM`: a fixed budget in clock ticks, divided by the
/// ready-queue length so a busier CPU gives each thread a smaller slice.
const PSP_THREAD_QUANTUM: u64 = 30;
/// Floor under the divided quantum, restored as `PSP_THREAD_MIN_QUANTUM`.
const PSP_THREAD_MIN_QUANTUM: u64 = 3;

/// Bitmap of CPUs currently running their idle thread, set on entry and
/// cleared on exit (§4.8). Used as the scheduler's fast first check before
/// falling back to a full least-loaded scan.
static IDLE_CPUS: AtomicU32 = AtomicU32::new(0);

fn mark_idle(cpu_id: u32) {
    IDLE_CPUS.fetch_or(1 << cpu_id, Ordering::AcqRel);
}

fn clear_idle(cpu_id: u32) {
    IDLE_CPUS.fetch_and(!(1 << cpu_id), Ordering::AcqRel);
}

fn first_idle_cpu() -> Option<u32> {
    let bits = IDLE_CPUS.load(Ordering::Acquire);
    if bits == 0 {
        None
    } else {
        Some(bits.trailing_zeros())
    }
}

/// Where in the target queue a newly-runnable thread lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Woken from an event wait: jumps the queue.
    Head,
    /// Freshly created, or requeued after a quantum expiry: waits its turn.
    Tail,
}

/// Place `thread` on a ready queue: the current CPU's if this CPU is idle or
/// no less-loaded CPU exists, otherwise the least-loaded online CPU's queue
/// (idle CPUs preferred via the fast-path mask, matching §4.11's "leftmost
/// idle CPU" first check before the full scan restored from
/// `PsReadyThread`).
pub fn queue_thread(thread: ThreadPtr, placement: Placement) {
    // SAFETY: `thread` is off every queue at this point (either newly
    // created, or just removed from a wait list by the caller).
    let t = unsafe { thread.get() };
    t.state = ThreadState::Queued;

    if let Some(cpu_id) = first_idle_cpu() {
        if push_onto(cpu_id, thread, placement) {
            return;
        }
    }

    let home = crate::cpu::current_cpu_id();
    let mut best_cpu = home;
    let mut best_len = usize::MAX;
    for cpu_id in 0..crate::cpu::MAX_CPUS as u32 {
        if !crate::cpu::get(cpu_id).is_online() {
            continue;
        }
        let len = crate::cpu::get(cpu_id).queues.lock().ready.len();
        if len < best_len {
            best_len = len;
            best_cpu = cpu_id;
        }
    }

    if push_onto(best_cpu, thread, placement) {
        return;
    }
    // Every candidate raced us out from under the lock (e.g. went offline);
    // the current CPU keeps the thread rather than drop it.
    push_onto(home, thread, placement);
}

/// Try to push `thread` onto `cpu_id`'s ready queue. Always succeeds for an
/// online CPU; returns `false` only if `cpu_id` is not online.
fn push_onto(cpu_id: u32, thread: ThreadPtr, placement: Placement) -> bool {
    let cpu = crate::cpu::get(cpu_id);
    if !cpu.is_online() {
        return false;
    }
    // SAFETY: `thread` is not linked into any queue right now (caller's
    // invariant); the queue lock serializes the push against concurrent
    // scheduling decisions on `cpu_id`.
    unsafe {
        let mut queues = cpu.queues.lock();
        match placement {
            Placement::Head => queues.ready.push_front(thread.as_ptr()),
            Placement::Tail => queues.ready.push_back(thread.as_ptr()),
        }
    }
    thread.get().processor = cpu_id;
    if cpu_id == crate::cpu::current_cpu_id() {
        clear_idle(cpu_id);
    }
    true
}

/// Quantum for a CPU whose ready queue (including the about-to-run thread)
/// has `ready_len` entries, per §4.11's `max(default/len, minimum)` formula.
fn quantum_for(ready_len: usize) -> u64 {
    let len = ready_len.max(1) as u64;
    (PSP_THREAD_QUANTUM / len).max(PSP_THREAD_MIN_QUANTUM)
}

/// Block the current thread and switch to the next runnable one. Called by
/// `event::wait_for_object` after the thread has been linked onto the wait
/// list and its state set to `Waiting`, with no lock held.
pub fn block_current_and_switch() {
    let old_irql = crate::sync::raise_irql(Irql::Dispatch);
    switch_away_from_current();
    crate::sync::lower_irql(old_irql);
}

/// Pick the next ready thread (or the idle thread) and switch into it,
/// leaving the outgoing thread's state exactly as the caller set it
/// (`Waiting`, or `Queued` on a voluntary yield).
///
/// Must be called at `DISPATCH` IRQL or higher.
fn switch_away_from_current() {
    let cpu = crate::cpu::current();
    let current = crate::cpu::current_thread();

    let next = {
        let mut queues = cpu.queues.lock();
        queues.ready.pop_front()
    };

    let (next, is_idle) = match next {
        Some(ptr) => {
            clear_idle(cpu.cpu_id);
            // SAFETY: came straight off this CPU's own ready queue.
            (unsafe { ThreadPtr::new(ptr) }, false)
        }
        None => {
            mark_idle(cpu.cpu_id);
            // SAFETY: every online CPU has an idle thread installed by
            // `scheduler::set_idle_thread` before it leaves bring-up.
            (unsafe { (*cpu.idle_thread.get()).expect("idle thread not installed") }, true)
        }
    };

    if next.as_ptr() == current.as_ptr() {
        return;
    }

    let ready_len = cpu.queues.lock().ready.len() + 1;
    // SAFETY: `next` and `current` are distinct, live threads; `current` is
    // the thread presently executing on this CPU.
    let (from, to) = unsafe { (current.get(), next.get()) };
    to.state = ThreadState::Running;
    // `expiration == 0` marks the idle thread as always eligible and never
    // expiring (§3); every other thread gets a fresh quantum deadline.
    if !is_idle {
        to.expiration = cpu.ticks.load(Ordering::Relaxed) + quantum_for(ready_len);
    }
    // SAFETY: called at DISPATCH or higher, per this function's contract.
    unsafe {
        crate::cpu::set_current_thread(next);
        thread::context_switch(from, to);
    }
}

/// Voluntarily give up the remainder of the current quantum.
pub fn yield_now() {
    let old_irql = crate::sync::raise_irql(Irql::Dispatch);
    let current = crate::cpu::current_thread();
    // SAFETY: `current` is the running thread on this CPU.
    let t = unsafe { current.get() };
    if t.state == ThreadState::Running {
        t.state = ThreadState::Queued;
        queue_thread(current, Placement::Tail);
    }
    switch_away_from_current();
    crate::sync::lower_irql(old_irql);
}

/// Mark the current thread `Terminated` and switch away for good. The
/// thread's stack and control block are freed by a DPC queued on the
/// *target* CPU (the one about to run next) before the switch executes, per
/// §4.11/§1B -- the outgoing thread cannot free the stack it stands on.
pub fn terminate_current() -> ! {
    let old_irql = crate::sync::raise_irql(Irql::Dispatch);
    let cpu = crate::cpu::current();
    let current = crate::cpu::current_thread();
    // SAFETY: `current` is the running thread on this CPU, about to be
    // removed from scheduling entirely.
    let t = unsafe { current.get() };
    t.state = ThreadState::Terminated;

    {
        let mut queues = cpu.queues.lock();
        unsafe { queues.termination.push_back(current.as_ptr()) };
    }
    queue_termination_dpc(current);

    switch_away_from_current();
    unreachable!("terminated thread resumed");
}

/// One termination DPC per terminated thread; queued on the CPU that is
/// about to become current (the scheduling decision's target), so it runs
/// immediately after the switch completes, at DISPATCH level, long before
/// anything could reuse the freed stack.
fn queue_termination_dpc(thread: ThreadPtr) {
    extern "C" fn reap_trampoline(context: usize) {
        // SAFETY: `context` was built from a live `ThreadPtr` by
        // `queue_termination_dpc`, which leaked the one-shot `Dpc` box
        // exactly once for this call.
        let thread = unsafe { ThreadPtr::new(core::ptr::NonNull::new_unchecked(context as *mut Thread)) };
        if let Err(e) = crate::sched::thread::reap(thread) {
            log::warn!("termination DPC: reap failed: {:?}", e);
        }
    }

    // SAFETY: `dpc` is heap-allocated via the pool and leaked intentionally;
    // `drain_dpc_queue` runs it exactly once and never touches it again,
    // so leaking the allocation for the DPC's own lifetime is correct --
    // there is no second owner to free it, matching the teacher's static
    // one-shot DPC idiom used elsewhere for deferred frees.
    let context = thread.as_ptr().as_ptr() as usize;
    match crate::mm::pool::alloc(core::mem::size_of::<Dpc>(), *b"Dpc_") {
        Ok(block) => {
            let dpc_ptr = block.cast::<Dpc>();
            unsafe {
                dpc_ptr.as_ptr().write(Dpc::new(reap_trampoline, context));
                dpc::queue_dpc(dpc_ptr);
            }
        }
        Err(e) => {
            // Out of pool memory while tearing a thread down is a hard
            // stop: there is no safe way to retry from inside the
            // scheduling decision with the queue lock already released.
            crate::panic::fatal_error(crate::panic::PanicCode::KernelInitializationFailure, e as u64, 0, 0, 0);
        }
    }
}

/// Install `thread` as `cpu_id`'s idle thread. Called once per CPU during
/// bring-up, before that CPU is marked online.
pub fn set_idle_thread(cpu_id: u32, thread: ThreadPtr) {
    let cpu = crate::cpu::get(cpu_id);
    // SAFETY: called once, by the owning CPU, before it is marked online and
    // therefore before the scheduler can observe this slot.
    unsafe { *cpu.idle_thread.get() = Some(thread) };
    mark_idle(cpu_id);
}

/// The clock-tick handler: drains the work queue, then the DPC queue, scans
/// the wait-queue for expired timeouts, and finally checks the running
/// thread's quantum -- this exact order restored from
/// `KiProcessWorkQueue`/`PspScheduleNext` (§1B).
pub fn clock_tick() {
    let old_irql = crate::sync::raise_irql(Irql::Dispatch);
    let cpu = crate::cpu::current();
    cpu.ticks.fetch_add(1, Ordering::Relaxed);

    dpc::drain_work_queue();
    dpc::drain_dpc_queue();

    scan_wait_queue_deadlines();

    let expired = {
        let current = crate::cpu::current_thread();
        // SAFETY: `current` is the running thread on this CPU.
        let t = unsafe { current.get() };
        t.expiration != 0 && cpu.ticks.load(Ordering::Relaxed) >= t.expiration
    };
    if expired {
        yield_now_at_dispatch();
    }

    crate::sync::lower_irql(old_irql);
}

/// `yield_now`'s body, for callers already at `DISPATCH` (the clock-tick
/// handler itself).
fn yield_now_at_dispatch() {
    let current = crate::cpu::current_thread();
    // SAFETY: `current` is the running thread on this CPU.
    let t = unsafe { current.get() };
    if t.state == ThreadState::Running {
        t.state = ThreadState::Queued;
        queue_thread(current, Placement::Tail);
    }
    switch_away_from_current();
}

/// Walk the current CPU's wait queue; any thread whose deadline has passed
/// is unlinked from its event's wait list and re-queued, with `wait_ticks`
/// left non-zero so `wait_for_object` reports a timeout rather than a wake.
/// A thread that a concurrent `wake_single_thread` already dequeued is no
/// longer `Waiting` and is skipped -- whichever side reached the thread's
/// owning-CPU lock first wins (§4.14 cancellation/timeout race).
fn scan_wait_queue_deadlines() {
    let cpu = crate::cpu::current();
    let now = cpu.ticks.load(Ordering::Relaxed);

    let mut expired = heapless_expired_buffer();
    {
        let mut queues = cpu.queues.lock();
        for ptr in queues.wait.iter() {
            // SAFETY: `ptr` is a live entry of this CPU's wait queue.
            let t = unsafe { ptr.as_ref() };
            if t.wait_ticks != 0 && t.wait_ticks <= now {
                expired.push(ptr);
            }
        }
        for ptr in expired.items[..expired.len].iter().flatten() {
            unsafe { queues.wait.remove(*ptr) };
        }
    }

    for ptr in expired.drain() {
        // SAFETY: came off the wait queue above and is not linked anywhere
        // else (queue membership is exclusive, §3 "Ownership").
        let t = unsafe { &mut *ptr.as_ptr() };
        if t.state != ThreadState::Waiting {
            continue;
        }
        if let Some(obj) = t.wait_object.take() {
            // SAFETY: `obj` is the event this thread was waiting on; it
            // outlives the wait (owned by the caller of `wait_for_object`).
            let header = unsafe { obj.as_ref() };
            header.lock.lock().wait_list.remove(ptr);
        }
        t.state = ThreadState::Queued;
        // `wait_ticks` is left non-zero: `wait_for_object` reads
        // `wait_ticks == 0` to distinguish a signal wake from a timeout.
        let woken = unsafe { ThreadPtr::new(ptr) };
        queue_thread(woken, Placement::Tail);
    }
}

/// Small fixed-capacity scratch buffer for the wait-scan above, avoiding a
/// heap allocation while the queue lock is held.
struct ExpiredBuf {
    items: [Option<core::ptr::NonNull<Thread>>; 16],
    len: usize,
}

fn heapless_expired_buffer() -> ExpiredBuf {
    ExpiredBuf { items: [None; 16], len: 0 }
}

impl ExpiredBuf {
    fn push(&mut self, ptr: core::ptr::NonNull<Thread>) {
        if self.len < self.items.len() {
            self.items[self.len] = Some(ptr);
            self.len += 1;
        } else {
            // More than 16 timeouts expiring on the same tick on one CPU is
            // not expected at this kernel's scale; drop the overflow rather
            // than grow unboundedly with the queue lock released.
            log::warn!("wait-queue deadline scan: scratch buffer overflow, some timeouts delayed a tick");
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = core::ptr::NonNull<Thread>> + '_ {
        let len = self.len;
        self.len = 0;
        self.items[..len].iter_mut().filter_map(|slot| slot.take())
    }
}

/// Idle loop: parks this CPU as idle, runs the kernel-stack cache trim hook
/// on each periodic wake, then halts until the next interrupt. Never enters
/// a ready queue itself (§4.11); after each wake it checks whether the
/// reschedule or timer IPI that woke it left something runnable, and if so
/// switches into it directly (the idle thread's `expiration` stays `0`, so
/// it never loses its slot to a quantum expiry -- only to a thread showing
/// up on the ready queue).
///
/// # Safety
/// Caller must be running as the current thread on `cpu_id` (the idle
/// thread installed by `set_idle_thread`), reached either directly from
/// boot (before any context switch exists) or via `context_switch` like any
/// other thread.
pub fn idle_loop(cpu_id: u32) -> ! {
    mark_idle(cpu_id);
    loop {
        crate::mm::kstack::idle_trim_hook(cpu_id);
        crate::intrinsics::enable_interrupts();
        crate::intrinsics::halt();
        crate::intrinsics::disable_interrupts();

        let ready = !crate::cpu::get(cpu_id).queues.lock().ready.is_empty();
        if ready {
            let old_irql = crate::sync::raise_irql(Irql::Dispatch);
            switch_away_from_current();
            crate::sync::lower_irql(old_irql);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn quantum_shrinks_with_queue_length() {
        assert_eq!(quantum_for(1), PSP_THREAD_QUANTUM.max(PSP_THREAD_MIN_QUANTUM));
        assert!(quantum_for(100) >= PSP_THREAD_MIN_QUANTUM);
        assert!(quantum_for(100) <= quantum_for(1));
    }

    #[test_case]
    fn idle_mask_tracks_mark_and_clear() {
        IDLE_CPUS.store(0, Ordering::Relaxed);
        mark_idle(2);
        assert_eq!(first_idle_cpu(), Some(2));
        clear_idle(2);
        assert_eq!(first_idle_cpu(), None);
    }
}
