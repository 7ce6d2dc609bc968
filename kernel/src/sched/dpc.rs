//! Deferred procedure calls and work items.
//!
//! A DPC defers a callback from whatever IRQL an interrupt handler ran at
//! down to dispatch-level, where it is safe to touch scheduler state. A work
//! item is the dispatch-level-triggered counterpart used by thread
//! termination and other callers that need to run on a *specific* CPU after
//! the fact rather than "soon, on whichever CPU took the interrupt."
//!
//! Both are drained at the head of every clock tick, DPC queue before work
//! queue, ahead of the wait-queue deadline scan and the quantum check --
//! the exact sub-step order restored from the original implementation's
//! clock-tick handler.

use core::sync::atomic::{AtomicBool, Ordering};
use core::ptr::NonNull;

use crate::error::KernelResult;
use crate::sync::list::{Linked, ListLink};

pub type DpcRoutine = extern "C" fn(context: usize);

pub struct Dpc {
    pub link: ListLink<Dpc>,
    routine: DpcRoutine,
    context: usize,
}

unsafe impl Linked for Dpc {
    fn link(&self) -> &ListLink<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self> {
        &mut self.link
    }
}

impl Dpc {
    pub const fn new(routine: DpcRoutine, context: usize) -> Self {
        Self { link: ListLink::new(), routine, context }
    }
}

/// Queue `dpc` on the current CPU. `dpc` must stay valid (commonly a
/// `'static` or pool-allocated value) until it runs.
///
/// # Safety
/// `dpc` must not already be linked into any queue, and must remain valid
/// and unmoved until its routine has run.
pub unsafe fn queue_dpc(dpc: NonNull<Dpc>) {
    crate::cpu::current().dpc_queue.lock().push_back(dpc);
}

/// Drain and run every DPC queued on the current CPU. Must be called at
/// `DISPATCH` IRQL or higher; routines must not block.
pub fn drain_dpc_queue() {
    loop {
        let Some(mut dpc) = crate::cpu::current().dpc_queue.lock().pop_front() else { break };
        // SAFETY: `dpc` was linked via `queue_dpc` and is now unlinked and
        // exclusively ours to run.
        let (routine, context) = unsafe { (dpc.as_ref().routine, dpc.as_ref().context) };
        routine(context);
        let _ = unsafe { dpc.as_mut() };
    }
}

pub type WorkRoutine = extern "C" fn(context: usize);

/// Work-item priority: high priority pokes the target CPU with an IPI
/// immediately; low priority waits for that CPU's next clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkPriority {
    Low,
    High,
}

pub struct WorkItem {
    pub link: ListLink<WorkItem>,
    routine: WorkRoutine,
    context: usize,
    queued: AtomicBool,
}

unsafe impl Linked for WorkItem {
    fn link(&self) -> &ListLink<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self> {
        &mut self.link
    }
}

impl WorkItem {
    pub const fn new(routine: WorkRoutine, context: usize) -> Self {
        Self { link: ListLink::new(), routine, context, queued: AtomicBool::new(false) }
    }
}

/// Enqueue `item` onto `cpu_id`'s work queue. `queued` is set via
/// compare-and-swap so an item already in flight is never double-queued.
///
/// # Safety
/// `item` must remain valid and unmoved until its routine runs.
pub unsafe fn queue_work(
    cpu_id: u32,
    item: NonNull<WorkItem>,
    priority: WorkPriority,
) -> KernelResult<()> {
    let already_queued = item
        .as_ref()
        .queued
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err();
    if already_queued {
        return Ok(());
    }
    crate::cpu::get(cpu_id).work_queue.lock().push_back(item);
    if priority == WorkPriority::High {
        crate::cpu::smp::notify_cpu(cpu_id)?;
    }
    Ok(())
}

/// Drain and run every work item queued on the current CPU.
pub fn drain_work_queue() {
    loop {
        let Some(mut item) = crate::cpu::current().work_queue.lock().pop_front() else { break };
        // SAFETY: `item` was linked via `queue_work` and is now unlinked.
        let (routine, context) = unsafe { (item.as_ref().routine, item.as_ref().context) };
        unsafe { item.as_ref().queued.store(false, Ordering::Release) };
        routine(context);
        let _ = unsafe { item.as_mut() };
    }
}
