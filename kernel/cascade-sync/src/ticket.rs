//! FIFO-fair ticket spin lock.

use crate::PreemptionInterruptExclusion;
use cascade_arch::{self as arch, CpuId};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A fair spinlock protecting a value of type `T`.
///
/// Contenders draw a ticket with an atomic fetch-add and spin until the
/// `current` counter reaches their number, so the lock is granted strictly
/// in arrival order and no CPU can starve. Acquisition takes the combined
/// preemption+interrupt exclusion first, which makes the lock safe to use
/// from interrupt handlers.
///
/// The owning CPU is recorded in `holder`; while unlocked the holder is
/// [`CpuId::NONE`]. Re-entrant acquisition on the same CPU is a
/// programming error and aborts debug builds.
///
/// # Examples
///
/// ```
/// use cascade_sync::TicketSpinLock;
///
/// static COUNTER: TicketSpinLock<u64> = TicketSpinLock::new(0);
///
/// *COUNTER.lock() += 1;
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct TicketSpinLock<T: ?Sized> {
    /// Next ticket to hand out.
    ticket: AtomicU32,
    /// Ticket currently being served.
    current: AtomicU32,
    /// Raw [`CpuId`] of the holder, [`CpuId::NONE`] while unlocked.
    holder: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: mutual exclusion is provided by the ticket protocol; the data
// may cross CPUs only if it is Send.
unsafe impl<T: ?Sized + Send> Sync for TicketSpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for TicketSpinLock<T> {}

impl<T> TicketSpinLock<T> {
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            ticket: AtomicU32::new(0),
            current: AtomicU32::new(0),
            holder: AtomicU32::new(CpuId::NONE.as_u32()),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketSpinLock<T> {
    /// Acquire the lock, spinning in FIFO order until granted.
    ///
    /// Spins with interrupts disabled and never sleeps; keep critical
    /// sections short.
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let exclusion = PreemptionInterruptExclusion::acquire();
        let me = exclusion.cpu().id;
        debug_assert!(
            !self.is_locked_by(me),
            "recursive ticket lock acquisition on {me}"
        );

        let ticket = self.ticket.fetch_add(1, Ordering::AcqRel);
        while self.current.load(Ordering::Acquire) != ticket {
            arch::spin_hint();
        }
        self.holder.store(me.as_u32(), Ordering::Release);

        TicketGuard {
            lock: self,
            exclusion,
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<TicketGuard<'_, T>> {
        let exclusion = PreemptionInterruptExclusion::acquire();
        let me = exclusion.cpu().id;
        debug_assert!(
            !self.is_locked_by(me),
            "recursive ticket lock acquisition on {me}"
        );

        let current = self.current.load(Ordering::Relaxed);
        if self
            .ticket
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.holder.store(me.as_u32(), Ordering::Release);
        Some(TicketGuard {
            lock: self,
            exclusion,
        })
    }

    /// Run `f` with the lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Is the lock currently held by `cpu`?
    #[inline]
    #[must_use]
    pub fn is_locked_by(&self, cpu: CpuId) -> bool {
        self.holder.load(Ordering::Acquire) == cpu.as_u32()
    }

    /// Release the lock on behalf of a context that leaked its guard.
    ///
    /// Used by the scheduler when a task that held the lock has migrated
    /// in a controlled transition; no CPU-identity assertion is made.
    ///
    /// # Safety
    /// - The lock must be held, and its guard must have been leaked with
    ///   [`core::mem::forget`].
    /// - The caller takes over the leaked guard's exclusion obligation.
    pub unsafe fn unsafe_release(&self) {
        self.holder.store(CpuId::NONE.as_u32(), Ordering::Release);
        self.current.fetch_add(1, Ordering::Release);
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Guard returned by [`TicketSpinLock::lock`]; releases on drop.
pub struct TicketGuard<'a, T: ?Sized> {
    lock: &'a TicketSpinLock<T>,
    exclusion: PreemptionInterruptExclusion,
}

impl<T: ?Sized> Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert!(
            self.lock.is_locked_by(self.exclusion.cpu().id),
            "ticket lock released by a CPU that does not hold it"
        );
        self.lock
            .holder
            .store(CpuId::NONE.as_u32(), Ordering::Release);
        self.lock.current.fetch_add(1, Ordering::Release);
        // The exclusion token drops after this body, re-enabling
        // interrupts once the outermost token is gone.
    }
}
