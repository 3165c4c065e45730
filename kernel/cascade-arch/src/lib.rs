//! # Architecture capability surface
//!
//! The small set of CPU-control operations the rest of the kernel depends
//! on but does not implement itself: interrupt masking, the per-CPU
//! register, the spin hint, halting, and page-table mapping.
//!
//! Implementations are selected per target:
//!
//! - `x86_64` / `aarch64` / `riscv64` bare-metal builds (`target_os = "none"`)
//!   use inline assembly.
//! - Any hosted build (tests, doctests) uses a shim that emulates the
//!   interrupt flag and per-CPU storage with thread-locals, so the lock and
//!   allocator crates can be exercised with ordinary `std::thread`s.
//!
//! ## The per-CPU register
//!
//! Each architecture reserves one register for kernel-private per-CPU data
//! (`KERNEL_GS_BASE` on x86-64, `TPIDR_EL1` on AArch64, `sscratch` on
//! RISC-V). It holds a pointer to the CPU's [`CpuLocal`] record;
//! [`current_cpu`] reads it back. Reading is only meaningful while
//! interrupts are disabled, otherwise the executing CPU may change under
//! the caller.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

use core::fmt;
use core::sync::atomic::AtomicU32;

pub mod paging;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[path = "x86_64.rs"]
mod imp;

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[path = "aarch64.rs"]
mod imp;

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
#[path = "riscv64.rs"]
mod imp;

#[cfg(not(target_os = "none"))]
#[path = "hosted.rs"]
mod imp;

/// The smallest page size shared by all supported architectures.
pub const STANDARD_PAGE_SIZE: usize = 4096;

/// Identifier of a logical CPU.
///
/// [`CpuId::NONE`] is the sentinel used by lock holders to mean "no CPU".
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Sentinel: no CPU.
    pub const NONE: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("CpuId(NONE)")
        } else {
            write!(f, "CpuId({})", self.0)
        }
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("none")
        } else {
            write!(f, "cpu{}", self.0)
        }
    }
}

/// Kernel-private per-CPU record, pointed to by the per-CPU register.
///
/// Embedders (the kernel's `Executor`) place this at offset 0 of their own
/// per-CPU structure so the register can double as a pointer to either.
///
/// The exclusion counters are only ever mutated by the owning CPU; they are
/// atomics so the counter update cannot tear against an interrupt handler
/// running on the same CPU.
#[repr(C, align(64))] // own cache line; avoids false sharing between CPUs
pub struct CpuLocal {
    /// Logical CPU index (0 = bootstrap processor).
    pub id: CpuId,

    /// Nesting depth of preemption-disable tokens held on this CPU.
    pub preemption_disable_count: AtomicU32,

    /// Nesting depth of interrupt-disable tokens held on this CPU.
    pub interrupt_disable_count: AtomicU32,
}

impl CpuLocal {
    #[must_use]
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            preemption_disable_count: AtomicU32::new(0),
            interrupt_disable_count: AtomicU32::new(0),
        }
    }
}

/// Are maskable interrupts currently enabled on this CPU?
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// Mask maskable interrupts on this CPU.
#[inline]
pub fn disable_interrupts() {
    imp::disable_interrupts();
}

/// Unmask maskable interrupts on this CPU.
#[inline]
pub fn enable_interrupts() {
    imp::enable_interrupts();
}

/// Emit the architecture's busy-wait hint (`pause`, `yield`, ...).
#[inline]
pub fn spin_hint() {
    core::hint::spin_loop();
}

/// Disable interrupts and halt this CPU forever.
///
/// Used on unrecoverable errors; never returns.
pub fn disable_and_halt() -> ! {
    imp::disable_and_halt()
}

/// Install the per-CPU record pointer into the per-CPU register.
///
/// # Safety
/// `cpu` must point to a [`CpuLocal`] that outlives all subsequent
/// [`current_cpu`] calls on this CPU. Must be called with interrupts
/// disabled.
pub unsafe fn set_current_cpu(cpu: *const CpuLocal) {
    unsafe { imp::set_current_cpu(cpu) }
}

/// The calling CPU's [`CpuLocal`] record.
///
/// The result is only stable while interrupts are disabled (or preemption
/// is otherwise excluded); callers that merely peek at it must tolerate the
/// CPU changing underneath them.
///
/// # Panics
/// Panics if [`set_current_cpu`] has not run on this CPU. The hosted shim
/// instead registers a fresh record per thread, treating every test thread
/// as its own CPU.
#[inline]
#[must_use]
pub fn current_cpu() -> &'static CpuLocal {
    imp::current_cpu()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_id_formatting() {
        assert_eq!(CpuId::new(2).to_string(), "cpu2");
        assert_eq!(CpuId::NONE.to_string(), "none");
        assert_ne!(CpuId::new(0), CpuId::NONE);
    }

    #[test]
    fn hosted_shim_tracks_interrupt_flag() {
        assert!(interrupts_enabled());
        disable_interrupts();
        assert!(!interrupts_enabled());
        enable_interrupts();
        assert!(interrupts_enabled());
    }

    #[test]
    fn hosted_shim_assigns_one_cpu_per_thread() {
        let here = current_cpu().id;
        assert_eq!(current_cpu().id, here);
        let other = std::thread::spawn(|| current_cpu().id).join().unwrap();
        assert_ne!(here, other);
    }
}
