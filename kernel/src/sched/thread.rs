//! Thread objects: creation, the saved register context, and the
//! intrusive linkage that lets a thread live on exactly one queue at a time.
//!
//! A thread is always on exactly one of: a CPU's ready queue, its wait
//! queue, its termination queue, or an event's wait list (besides the
//! running slot, which is not a queue at all) -- the `list_link`/
//! `wait_list_link` pair below gives each thread two independent embedded
//! links via `sync::list`'s tag parameter, mirroring the teacher's
//! `TaskPtr` intrusive-pointer idiom generalized to two linkages per node.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult, SchedError};
use crate::mm::types::VirtualAddress;
use crate::sync::list::{Linked, ListLink};

/// Tag distinguishing the ready/wait/termination-queue link from the
/// event-wait-list link on the same `Thread`.
pub struct QueueTag;
pub struct WaitListTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Queued,
    Running,
    Waiting,
    Terminated,
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    pub tid: u64,
    pub state: ThreadState,
    /// Saved stack pointer; on a suspended thread this addresses a fake
    /// frame `context_switch` can `pop`/`ret` its way back out of (the
    /// System V AMD64 callee-saved registers, then a return address).
    rsp: u64,
    pub stack_base: VirtualAddress,
    pub stack_limit: VirtualAddress,
    pub list_link: ListLink<Thread, QueueTag>,
    pub wait_list_link: ListLink<Thread, WaitListTag>,
    /// Event this thread is sleeping on, or `None`.
    pub wait_object: Option<NonNull<crate::sched::event::EventHeader>>,
    /// Timer-tick deadline; `0` means no timeout for this wait.
    pub wait_ticks: u64,
    pub processor: u32,
    /// Quantum deadline in ticks; `0` marks the idle thread (always
    /// eligible, never expires).
    pub expiration: u64,
    entry: extern "C" fn(usize) -> !,
    entry_arg: usize,
}

unsafe impl Linked<QueueTag> for Thread {
    fn link(&self) -> &ListLink<Self, QueueTag> {
        &self.list_link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self, QueueTag> {
        &mut self.list_link
    }
}

unsafe impl Linked<WaitListTag> for Thread {
    fn link(&self) -> &ListLink<Self, WaitListTag> {
        &self.wait_list_link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self, WaitListTag> {
        &mut self.wait_list_link
    }
}

/// A `NonNull<Thread>` with the invariant that the pointee's backing
/// allocation (a pool block tagged `b"Thrd"`) outlives every copy, freed
/// only by the termination DPC once the thread is fully off every queue.
#[derive(Clone, Copy)]
pub struct ThreadPtr(NonNull<Thread>);

impl ThreadPtr {
    /// # Safety
    /// `ptr` must address a live `Thread` allocated by [`create_thread`].
    pub unsafe fn new(ptr: NonNull<Thread>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> NonNull<Thread> {
        self.0
    }

    /// # Safety
    /// Caller must not alias this reference with a concurrent mutable
    /// access from another CPU; threads are only mutated under the owning
    /// CPU's or event's lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Thread {
        &mut *self.0.as_ptr()
    }
}

// SAFETY: a `ThreadPtr` only ever crosses CPUs while the thread is parked on
// a queue protected by a `SpinLock`; all mutation happens under that lock.
unsafe impl Send for ThreadPtr {}
unsafe impl Sync for ThreadPtr {}

const STACK_TAG: [u8; 4] = *b"Thrd";

/// Create a new thread, allocating its kernel stack and wiring its initial
/// context so that the first `context_switch` into it calls `entry(arg)`.
pub fn create_thread(entry: extern "C" fn(usize) -> !, arg: usize) -> KernelResult<ThreadPtr> {
    let top = crate::mm::kstack::alloc_kernel_stack()?;
    let base = VirtualAddress::new(top.as_u64() - crate::mm::kstack::KSTACK_SIZE as u64);

    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let mut thread = Thread {
        tid,
        state: ThreadState::Created,
        rsp: 0,
        stack_base: base,
        stack_limit: top,
        list_link: ListLink::new(),
        wait_list_link: ListLink::new(),
        wait_object: None,
        wait_ticks: 0,
        processor: u32::MAX,
        expiration: 0,
        entry,
        entry_arg: arg,
    };
    prepare_initial_stack(&mut thread);

    let layout_size = core::mem::size_of::<Thread>();
    let block = crate::mm::pool::alloc(layout_size, STACK_TAG)?;
    // SAFETY: `block` is a freshly allocated, uninitialized, correctly
    // sized and aligned region for `Thread` (pool blocks are at least
    // pointer-aligned, matching `Thread`'s alignment requirement).
    let ptr = block.cast::<Thread>();
    unsafe {
        ptr.as_ptr().write(thread);
        Ok(ThreadPtr::new(ptr))
    }
}

/// Lay out the new thread's stack so that `context_switch`'s `pop`/`ret`
/// sequence lands on `thread_trampoline` with six garbage callee-saved
/// slots above it, exactly mimicking what a real `context_switch` call
/// would have pushed for a thread that is merely suspended.
fn prepare_initial_stack(thread: &mut Thread) {
    // SAFETY: `stack_limit` addresses the top of a freshly allocated,
    // 16 KiB-aligned kernel stack with room for 7 machine words below it.
    unsafe {
        let mut sp = thread.stack_limit.as_u64() as *mut u64;
        sp = sp.sub(1);
        sp.write(thread_trampoline as usize as u64); // return address for `ret`
        sp = sp.sub(1);
        sp.write(0); // rbp
        sp = sp.sub(1);
        sp.write(0); // rbx
        sp = sp.sub(1);
        sp.write(0); // r12
        sp = sp.sub(1);
        sp.write(0); // r13
        sp = sp.sub(1);
        sp.write(0); // r14
        sp = sp.sub(1);
        sp.write(0); // r15
        thread.rsp = sp as u64;
    }
}

/// Every freshly created thread's `rip` resumes here (not at `entry`
/// directly) so that termination after `entry` returns -- which it must
/// never do, since `entry`'s signature is `-> !` -- is defensively caught.
extern "C" fn thread_trampoline() -> ! {
    let current = crate::cpu::current_thread();
    let thread = unsafe { current.get() };
    (thread.entry)(thread.entry_arg);
}

/// Free a terminated thread's stack and control block. Called only from the
/// termination DPC queued on the target CPU during the scheduling decision
/// that switched away from this thread -- never by the thread itself, which
/// cannot free the stack it is standing on.
pub fn reap(thread: ThreadPtr) -> KernelResult<()> {
    // SAFETY: by the time a thread reaches the termination queue it is off
    // every other queue and no other CPU holds a reference.
    unsafe {
        let t = thread.get();
        if t.state != ThreadState::Terminated {
            return Err(KernelError::Scheduler(SchedError::InvalidPriority { priority: 0 }));
        }
        crate::mm::kstack::free_kernel_stack(t.stack_limit)?;
        core::ptr::drop_in_place(t as *mut Thread);
        crate::mm::pool::free(thread.as_ptr().cast::<u8>());
    }
    Ok(())
}

/// Switch from `from`'s context to `to`'s context. Returns when some other
/// CPU switches back into `from`.
///
/// # Safety
/// `from` must be the context of the thread currently executing on this
/// CPU; `to` must be a valid, previously-prepared or previously-suspended
/// thread context. Caller must already be at `DISPATCH` IRQL or higher.
#[inline(never)]
pub unsafe fn context_switch(from: &mut Thread, to: &mut Thread) {
    core::arch::asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [{from_rsp}], rsp",
        "mov rsp, [{to_rsp}]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        from_rsp = in(reg) &mut from.rsp,
        to_rsp = in(reg) &to.rsp,
        out("rax") _,
        out("rcx") _,
        out("rdx") _,
        out("rsi") _,
        out("rdi") _,
        out("r8") _,
        out("r9") _,
        out("r10") _,
        out("r11") _,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn thread_state_transitions_are_distinct() {
        assert_ne!(ThreadState::Created, ThreadState::Queued);
        assert_ne!(ThreadState::Running, ThreadState::Waiting);
    }
}
