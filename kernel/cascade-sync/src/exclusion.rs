//! CPU exclusion tokens.
//!
//! Two independent axes of exclusion, each tracked by a nesting counter on
//! the owning CPU:
//!
//! - **Preemption**: while held, the scheduler must not migrate or
//!   preempt the current context. Acquiring does not touch the interrupt
//!   flag, so a preemption-only mutex stays cheap.
//! - **Interrupts**: while held, maskable interrupts are disabled.
//!   Acquired by anything an interrupt handler may also take (the ticket
//!   lock).
//!
//! A token is bound to the CPU that produced it: the types are neither
//! `Send` nor `Clone`, so the obligation to release cannot be duplicated
//! or carried to another CPU. Releasing the outermost token of an axis
//! restores that axis (interrupts are re-enabled exactly when the
//! outermost interrupt token is released).

use cascade_arch::{self as arch, CpuLocal};
use core::marker::PhantomData;
use core::sync::atomic::Ordering;

/// Witness that preemption is disabled on the current CPU.
///
/// Dropping the token decrements the CPU's nesting counter; the scheduler
/// consults that counter before preempting.
pub struct PreemptionExclusion {
    cpu: &'static CpuLocal,
    _not_send: PhantomData<*mut ()>,
}

impl PreemptionExclusion {
    /// Disable preemption on the calling CPU.
    ///
    /// Does not modify the interrupt flag.
    #[must_use]
    pub fn acquire() -> Self {
        let cpu = arch::current_cpu();
        cpu.preemption_disable_count.fetch_add(1, Ordering::Relaxed);
        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// The CPU this token pins the caller to.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> &'static CpuLocal {
        self.cpu
    }
}

impl Drop for PreemptionExclusion {
    fn drop(&mut self) {
        let previous = self.cpu.preemption_disable_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unbalanced preemption exclusion");
    }
}

/// Witness that maskable interrupts are disabled on the current CPU.
pub struct InterruptExclusion {
    cpu: &'static CpuLocal,
    _not_send: PhantomData<*mut ()>,
}

impl InterruptExclusion {
    /// Disable interrupts on the calling CPU and record the nesting.
    ///
    /// Interrupts are masked *before* the per-CPU record is read, so the
    /// returned reference cannot go stale under the caller.
    #[must_use]
    pub fn acquire() -> Self {
        arch::disable_interrupts();
        let cpu = arch::current_cpu();
        cpu.interrupt_disable_count.fetch_add(1, Ordering::Relaxed);
        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// The CPU this token pins the caller to.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> &'static CpuLocal {
        self.cpu
    }
}

impl Drop for InterruptExclusion {
    fn drop(&mut self) {
        let previous = self.cpu.interrupt_disable_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unbalanced interrupt exclusion");
        if previous == 1 {
            arch::enable_interrupts();
        }
    }
}

/// The product of both exclusion axes.
///
/// Acquired preemption-first, interrupts-second; dropping releases in
/// reverse order (field order drives the drop order).
pub struct PreemptionInterruptExclusion {
    interrupts: InterruptExclusion,
    _preemption: PreemptionExclusion,
}

impl PreemptionInterruptExclusion {
    #[must_use]
    pub fn acquire() -> Self {
        let preemption = PreemptionExclusion::acquire();
        let interrupts = InterruptExclusion::acquire();
        Self {
            interrupts,
            _preemption: preemption,
        }
    }

    /// The CPU this token pins the caller to.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> &'static CpuLocal {
        self.interrupts.cpu()
    }
}
