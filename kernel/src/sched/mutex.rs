//! Recursive mutex with contention counting, layered on `sched::event`.
//!
//! Owner, recursion depth, and contention count all live under the same
//! single spin lock as the wait-list/signaled state (`EventHeader::lock`,
//! `M.lock` in the design notes) -- there is exactly one critical section a
//! caller can be inside at a time, so `try_acquire`'s owner check, its
//! contention-gated fast path, and `release`'s handoff decision all observe
//! a consistent snapshot of each other. The `contention` field is the
//! correctness crux: exactly one "right to acquire" is in flight at a time,
//! and it always rests with exactly one party -- the current owner, or a
//! single already-dequeued waiter. A release that hands ownership to a
//! dequeued waiter leaves `signaled = false` specifically so a thread racing
//! in through `try_acquire` cannot steal the slot out from under the waiter
//! that `wake_single_thread` already committed to running -- restored from
//! the original implementation's `EvpWakeSingleThread` interplay.

use core::cell::UnsafeCell;

use crate::panic::{fatal_error, PanicCode};
use crate::sched::event::{self, EventHeader, EventKind, EventState};
use crate::sched::thread::ThreadPtr;

pub struct Mutex {
    header: EventHeader,
    /// Owner, recursion depth, and contention count -- read and written
    /// only while `header.lock` is held; see module docs.
    owner: UnsafeCell<Option<ThreadPtr>>,
    recursion: UnsafeCell<u32>,
    contention: UnsafeCell<u32>,
}

// SAFETY: `owner`/`recursion`/`contention` are touched only while holding
// `header.lock`, which serializes every access across CPUs.
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            header: EventHeader::new(EventKind::Mutex, true),
            owner: UnsafeCell::new(None),
            recursion: UnsafeCell::new(0),
            contention: UnsafeCell::new(0),
        }
    }

    fn current_tid() -> u64 {
        // SAFETY: reading another thread's tid through a live pointer it
        // owns is fine; tid is set once at creation and never mutated.
        unsafe { crate::cpu::current_thread().get().tid }
    }

    /// Grant ownership to the current thread if it already owns the mutex
    /// (recursive acquire), or if the mutex is free and no waiter already
    /// has dibs on it (`contention == 0`). Returns `false` otherwise.
    ///
    /// # Safety
    /// Caller must hold `self.header.lock` for the duration of this call;
    /// `state` must be the guard proving that.
    unsafe fn try_acquire_under_lock(&self, state: &mut EventState) -> bool {
        let current = crate::cpu::current_thread();
        let current_tid = current.get().tid;
        match *self.owner.get() {
            Some(o) if o.get().tid == current_tid => {
                *self.recursion.get() += 1;
                true
            }
            None if *self.contention.get() == 0 => {
                *self.recursion.get() = 1;
                *self.owner.get() = Some(current);
                state.signaled = false;
                true
            }
            _ => false,
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.header.lock.lock();
        // SAFETY: `state` proves `header.lock` is held.
        unsafe { self.try_acquire_under_lock(&mut state) }
    }

    /// Acquire the mutex, blocking up to `timeout_ticks` (`event::UNLIMITED`
    /// to wait forever). Returns `false` only on timeout.
    pub fn acquire(&self, timeout_ticks: u64) -> bool {
        {
            let mut state = self.header.lock.lock();
            // SAFETY: `state` proves `header.lock` is held.
            if unsafe { self.try_acquire_under_lock(&mut state) } {
                return true;
            }
            // SAFETY: still under `header.lock` acquired above.
            unsafe { *self.contention.get() += 1 };
        }

        if event::wait_for_object(&self.header, timeout_ticks) {
            // The releasing thread already decremented contention and
            // committed this thread as the next owner; just record it.
            let _state = self.header.lock.lock();
            // SAFETY: under `header.lock`.
            unsafe {
                *self.recursion.get() = 1;
                *self.owner.get() = Some(crate::cpu::current_thread());
            }
            true
        } else {
            let _state = self.header.lock.lock();
            // SAFETY: under `header.lock`.
            unsafe { *self.contention.get() -= 1 };
            false
        }
    }

    /// Release one level of recursion.
    ///
    /// Fatal (`MUTEX_NOT_OWNED`) if the caller is not the current owner --
    /// this is a contract violation, not a recoverable error.
    pub fn release(&self) {
        let mut state = self.header.lock.lock();
        let current_tid = Self::current_tid();
        // SAFETY: under `header.lock`.
        unsafe {
            match *self.owner.get() {
                Some(o) if o.get().tid == current_tid => {}
                _ => fatal_error(PanicCode::MutexNotOwned, current_tid, 0, 0, 0),
            }

            *self.recursion.get() -= 1;
            if *self.recursion.get() != 0 {
                return;
            }

            *self.owner.get() = None;

            if *self.contention.get() > 0 {
                *self.contention.get() -= 1;
                state.signaled = false;
                drop(state);
                event::wake_single_thread(&self.header);
            } else {
                state.signaled = true;
            }
        }
    }

    pub fn contention(&self) -> u32 {
        let _state = self.header.lock.lock();
        // SAFETY: under `header.lock`.
        unsafe { *self.contention.get() }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn new_mutex_has_no_contention() {
        let m = Mutex::new();
        assert_eq!(m.contention(), 0);
    }
}
