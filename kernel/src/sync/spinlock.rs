//! IRQL discipline and spin locks.
//!
//! Mirrors the Windows-style IRQL model: raising IRQL masks interrupts at or
//! below the new level on the current CPU only. A spin lock acquire always
//! raises to at least `DISPATCH_LEVEL` so that the owning CPU cannot be
//! preempted by the scheduler while holding the lock, and other CPUs spin
//! rather than block.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Sentinel meaning "no CPU currently holds this lock."
const NO_OWNER: u32 = u32::MAX;

/// Best-effort "current CPU" read for owner tracking. Before `cpu::smp` has
/// populated the LAPIC-to-CPU-ID table (i.e. before bring-up starts), this
/// always resolves to the boot CPU, which is correct since nothing else is
/// running yet.
fn owner_id() -> u32 {
    crate::cpu::current_cpu_id()
}

/// Interrupt request levels, lowest to highest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Irql {
    /// Normal thread execution.
    Passive = 0,
    /// Asynchronous procedure call delivery.
    Apc = 1,
    /// Scheduler and most spin locks run here.
    Dispatch = 2,
    /// Device interrupt levels (collapsed to one level on this platform).
    DeviceHigh = 3,
    /// Clock/timer interrupt.
    Clock = 13,
    /// Inter-processor interrupts.
    IpiLevel = 14,
    /// Highest level; masks everything including NMI delivery paths we control.
    High = 15,
}

impl Irql {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Irql::Passive,
            1 => Irql::Apc,
            2 => Irql::Dispatch,
            3 => Irql::DeviceHigh,
            13 => Irql::Clock,
            14 => Irql::IpiLevel,
            _ => Irql::High,
        }
    }
}

/// Read the current IRQL without changing it.
///
/// Backed by `cpu::PerCpu::irql`, indexed by the calling CPU -- each CPU
/// masks its own interrupts independently, so this must never be a single
/// shared value (it was, briefly, before multi-CPU bring-up actually ran).
pub fn current_irql() -> Irql {
    Irql::from_u8(crate::cpu::current().irql.load(Ordering::Relaxed))
}

/// Raise IRQL to `new`, returning the previous level.
///
/// Fatal (`IRQL_NOT_GREATER_OR_EQUAL`) if `new` is lower than the current
/// IRQL -- raising must never lower the level, callers use [`lower_irql`]
/// for that.
pub fn raise_irql(new: Irql) -> Irql {
    let old = current_irql();
    if new < old {
        crate::panic::fatal_error(
            crate::panic::PanicCode::IrqlNotGreaterOrEqual,
            new as u64,
            old as u64,
            0,
            0,
        );
    }
    if new >= Irql::Dispatch {
        crate::intrinsics::disable_interrupts();
    }
    crate::cpu::current().irql.store(new as u8, Ordering::Relaxed);
    old
}

/// Restore IRQL to a previously saved level.
///
/// Fatal (`IRQL_NOT_LESS_OR_EQUAL`) if `old` is higher than the current
/// IRQL.
pub fn lower_irql(old: Irql) {
    let current = current_irql();
    if old > current {
        crate::panic::fatal_error(
            crate::panic::PanicCode::IrqlNotLessOrEqual,
            old as u64,
            current as u64,
            0,
            0,
        );
    }
    crate::cpu::current().irql.store(old as u8, Ordering::Relaxed);
    if old < Irql::Dispatch {
        crate::intrinsics::enable_interrupts();
    }
}

/// RAII guard that restores the saved IRQL on drop.
#[must_use]
pub struct IrqlGuard {
    old: Irql,
}

/// Raise to `new` and return a guard that restores the old IRQL when dropped.
pub fn raise_irql_guarded(new: Irql) -> IrqlGuard {
    IrqlGuard { old: raise_irql(new) }
}

impl Drop for IrqlGuard {
    fn drop(&mut self) {
        lower_irql(self.old);
    }
}

/// A spin lock that raises IRQL to `Dispatch` on acquire.
///
/// Unlike a plain ticket lock, acquiring this lock changes scheduling state
/// on the current CPU: while held, the calling thread cannot be preempted or
/// migrated, and any interrupt at or below `Dispatch` is deferred. This is
/// the same contract as the teacher's `KeAcquireSpinLock`/`KeReleaseSpinLock`
/// pair for DISPATCH_LEVEL locks.
pub struct SpinLock<T> {
    locked: AtomicBool,
    /// Logical CPU ID currently holding the lock, `u32::MAX` when free.
    /// Best-effort identity tracking per §4.7 ("an identity is encoded when
    /// supported"); used only to catch same-CPU reentrancy and non-owner
    /// release, not to arbitrate acquisition.
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through `lock()`, which
// establishes exclusive ownership via the atomic `locked` flag.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irql: Irql,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, raising IRQL to `Dispatch` first.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irql = raise_irql(Irql::Dispatch);
        let me = owner_id();
        if self.owner.load(Ordering::Relaxed) == me {
            crate::panic::fatal_error(
                crate::panic::PanicCode::SpinLockAlreadyOwned,
                me as u64,
                0,
                0,
                0,
            );
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        self.owner.store(me, Ordering::Relaxed);
        SpinLockGuard { lock: self, irql }
    }

    /// Test whether the lock is currently held, without acquiring it.
    ///
    /// Grounded in the teacher's `KeTestSpinLock`: used by diagnostics and by
    /// assertions that a lock is (or is not) held by the caller's CPU.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irql = raise_irql(Irql::Dispatch);
        let me = owner_id();
        if self.owner.load(Ordering::Relaxed) == me {
            crate::panic::fatal_error(
                crate::panic::PanicCode::SpinLockAlreadyOwned,
                me as u64,
                0,
                0,
                0,
            );
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Relaxed);
            Some(SpinLockGuard { lock: self, irql })
        } else {
            lower_irql(irql);
            None
        }
    }
}

impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: guard is only constructed after successfully taking `locked`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: guard holds exclusive access for its lifetime.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let me = owner_id();
        if self.lock.owner.load(Ordering::Relaxed) != me {
            crate::panic::fatal_error(crate::panic::PanicCode::SpinLockNotOwned, me as u64, 0, 0, 0);
        }
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        lower_irql(self.irql);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn lock_excludes_reentry_detection() {
        let lock = SpinLock::new(0u32);
        assert!(!lock.is_locked());
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test_case]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(());
        let _g = lock.lock();
        // Can't re-acquire from the same thread without deadlocking on real
        // hardware; here we only check the flag state directly.
        assert!(lock.is_locked());
    }
}
