//! Events: the wait-list protocol and at-most-once wake that every
//! higher-level synchronization object (mutex, and eventually semaphores or
//! condition variables) is built from.
//!
//! `EventHeader` is the common prefix every wait-able object embeds.
//! `wait_for_object`/`wake_single_thread`/`wake_all_threads` are the only
//! wait/wake primitives in the system; everything else, including the
//! mutex in `sched::mutex`, layers on top of these three operations plus
//! the spin-lock discipline from `sync::spinlock`.

use core::ptr::NonNull;

use crate::sched::thread::{ThreadPtr, ThreadState, WaitListTag};
use crate::sync::list::IntrusiveList;
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Event,
    Mutex,
}

/// Common prefix of every wait-able object.
pub struct EventHeader {
    pub lock: SpinLock<EventState>,
    pub kind: EventKind,
}

pub struct EventState {
    /// `true` means a subsequent wait passes through immediately without
    /// blocking (the "already signaled" fast path).
    pub signaled: bool,
    pub wait_list: IntrusiveList<crate::sched::thread::Thread, WaitListTag>,
}

impl EventHeader {
    pub const fn new(kind: EventKind, initially_signaled: bool) -> Self {
        Self {
            lock: SpinLock::new(EventState {
                signaled: initially_signaled,
                wait_list: IntrusiveList::new(),
            }),
            kind,
        }
    }
}

/// `UNLIMITED` sentinel for `wait_for_object`'s timeout, meaning "wait
/// forever."
pub const UNLIMITED: u64 = 0;

/// Block the current thread on `obj` until it is signaled or `timeout_ticks`
/// elapses (`UNLIMITED` to wait forever). Returns `true` if woken by a
/// signal, `false` on timeout.
///
/// Must be called at `PASSIVE` or `APC` IRQL (not holding any spin lock);
/// raises internally to `SYNCH` for the duration of the object-lock section.
pub fn wait_for_object(obj: &EventHeader, timeout_ticks: u64) -> bool {
    {
        let mut state = obj.lock.lock();
        if state.signaled {
            // Whether passing through here should reset `signaled` is a
            // property of the concrete object (a mutex's `release` clears
            // it explicitly); the header itself just reports the state.
            return true;
        }

        let current = crate::cpu::current_thread();
        // SAFETY: `current` is the running thread on this CPU; nothing else
        // touches its wait-list link while it is not yet queued anywhere
        // else.
        let thread = unsafe { current.get() };
        thread.wait_object = Some(NonNull::from(obj));
        unsafe {
            state.wait_list.push_back(current.as_ptr());
        }

        let cpu = crate::cpu::current();
        if timeout_ticks != UNLIMITED {
            thread.wait_ticks = cpu.ticks.load(core::sync::atomic::Ordering::Relaxed) + timeout_ticks;
            let mut queues = cpu.queues.lock();
            unsafe {
                queues.wait.push_back(current.as_ptr());
            }
        } else {
            thread.wait_ticks = 0;
        }
        thread.state = ThreadState::Waiting;
    }
    // The object lock is released here (end of block above); the thread is
    // now committed to waiting and any `signal` will find it in the list.
    crate::sched::scheduler::block_current_and_switch();

    let current = crate::cpu::current_thread();
    // SAFETY: resumed on this CPU after being switched back in; no other
    // CPU mutates this thread's fields once it is running again.
    let thread = unsafe { current.get() };
    thread.wait_ticks == 0
}

/// Pop one thread from the front of `obj`'s wait list and requeue it as
/// runnable. No-op if the wait list is empty.
pub fn wake_single_thread(obj: &EventHeader) {
    let woken = {
        let mut state = obj.lock.lock();
        state.wait_list.pop_front()
    };
    let Some(thread_ptr) = woken else { return };
    // SAFETY: `thread_ptr` came off `obj`'s wait list, so it is a thread
    // currently in `Waiting` state with `wait_object` pointing at `obj`.
    let thread = unsafe { &mut *thread_ptr.as_ptr() };
    let owning_cpu = crate::cpu::get(thread.processor);
    {
        let mut queues = owning_cpu.queues.lock();
        if thread.state != ThreadState::Waiting {
            crate::panic::fatal_error(
                crate::panic::PanicCode::BadThreadState,
                thread.tid,
                thread.state as u64,
                0,
                0,
            );
        }
        if thread.wait_ticks != 0 {
            unsafe {
                queues.wait.remove(thread_ptr);
            }
        }
    }
    thread.state = ThreadState::Queued;
    thread.wait_ticks = 0;
    thread.wait_object = None;
    // SAFETY: `thread_ptr` was obtained from a live wait list entry created
    // by `wait_for_object`, which only ever links `ThreadPtr`-owned nodes.
    let ptr = unsafe { ThreadPtr::new(thread_ptr) };
    crate::sched::scheduler::queue_thread(ptr, crate::sched::scheduler::Placement::Head);
}

/// Wake every waiter on `obj`.
pub fn wake_all_threads(obj: &EventHeader) {
    loop {
        let empty = obj.lock.lock().wait_list.is_empty();
        if empty {
            break;
        }
        wake_single_thread(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn new_event_defaults_unsignaled() {
        let e = EventHeader::new(EventKind::Event, false);
        assert!(!e.lock.lock().signaled);
    }
}
