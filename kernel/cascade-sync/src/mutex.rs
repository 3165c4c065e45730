//! Preemption-only mutex.

use crate::PreemptionExclusion;
use cascade_arch as arch;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A mutex for thread context.
///
/// Uses the same FIFO ticket discipline as
/// [`TicketSpinLock`](crate::TicketSpinLock), but acquires only
/// *preemption* exclusion: interrupts stay enabled while the lock is held,
/// so it must never be taken from interrupt context.
///
/// Waiting currently spins. Once the scheduler exists, this type is the
/// seam where a wakeup-based blocking wait replaces the spin; callers
/// already treat `lock` as a potential suspension point.
pub struct Mutex<T: ?Sized> {
    ticket: AtomicU32,
    current: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            ticket: AtomicU32::new(0),
            current: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the mutex. May block (spin) for as long as another thread
    /// holds it; must not be called from interrupt context.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let exclusion = PreemptionExclusion::acquire();
        let ticket = self.ticket.fetch_add(1, Ordering::AcqRel);
        while self.current.load(Ordering::Acquire) != ticket {
            arch::spin_hint();
        }
        MutexGuard {
            mutex: self,
            _exclusion: exclusion,
        }
    }

    /// Try to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let exclusion = PreemptionExclusion::acquire();
        let current = self.current.load(Ordering::Relaxed);
        if self
            .ticket
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        Some(MutexGuard {
            mutex: self,
            _exclusion: exclusion,
        })
    }

    /// Run `f` with the mutex held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Release a mutex whose guard was leaked with [`core::mem::forget`].
    ///
    /// Exists for foreign acquire/release interfaces (the ACPI host
    /// callbacks) that cannot carry a guard across the C boundary.
    ///
    /// # Safety
    /// The mutex must be held by the calling context via a leaked guard,
    /// and the caller takes over that guard's preemption-exclusion
    /// obligation.
    pub unsafe fn unlock_unchecked(&self) {
        self.current.fetch_add(1, Ordering::Release);
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Guard returned by [`Mutex::lock`]; releases on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _exclusion: PreemptionExclusion,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.current.fetch_add(1, Ordering::Release);
    }
}
