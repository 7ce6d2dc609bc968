//! Thread scheduler: objects, the per-CPU core, wait/wake, mutexes, and
//! deferred work.
//!
//! `thread` owns creation/teardown and the context-switch primitive;
//! `scheduler` is the only caller of that primitive and the only place
//! allowed to move a thread between CPU queues; `event` and `mutex` are
//! built entirely on `scheduler::block_current_and_switch` and
//! `scheduler::queue_thread`; `dpc` is the deferred-callback mechanism the
//! clock tick and thread termination both use.

pub mod dpc;
pub mod event;
pub mod mutex;
pub mod scheduler;
pub mod thread;

use crate::error::KernelResult;

/// Spawn a new thread and make it runnable on some CPU. Thin wrapper tying
/// `thread::create_thread` to `scheduler::queue_thread` for callers that
/// don't need to inspect the `ThreadPtr` before the thread can run.
pub fn spawn(entry: extern "C" fn(usize) -> !, arg: usize) -> KernelResult<thread::ThreadPtr> {
    let t = thread::create_thread(entry, arg)?;
    scheduler::queue_thread(t, scheduler::Placement::Tail);
    Ok(t)
}

/// Give up the remainder of the current thread's quantum.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Terminate the calling thread. Never returns.
pub fn exit_current() -> ! {
    scheduler::terminate_current();
}
