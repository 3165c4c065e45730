//! Executors: the kernel's view of one logical CPU.

use crate::task::Task;
use cascade_addresses::VirtualAddress;
use cascade_arch::{self as arch, CpuId, CpuLocal};
use core::sync::atomic::AtomicPtr;

/// A kernel stack: `[base, base + size)`, growing downward from `top`.
#[derive(Copy, Clone, Debug)]
pub struct Stack {
    base: VirtualAddress,
    size: usize,
}

impl Stack {
    #[must_use]
    pub const fn new(base: VirtualAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Placeholder until the real stack is allocated.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: VirtualAddress::zero(),
            size: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// First address past the stack; the initial stack pointer.
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size as u64)
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// One logical CPU.
///
/// The bootstrap executor is statically allocated; the others live in a
/// heap array sized by the bootloader's CPU descriptor count. The
/// embedded [`CpuLocal`] must stay the first field: the per-CPU register
/// points at it, and [`Executor::current`] recovers the executor by
/// casting back.
#[repr(C)]
pub struct Executor {
    /// Must be at offset 0.
    pub cpu: CpuLocal,

    /// Local APIC id (or hart id) reported by the bootloader.
    pub lapic_id: u32,

    /// The task currently running on this executor.
    pub current_task: AtomicPtr<Task>,

    /// Stack used for ordinary kernel execution.
    pub kernel_stack: Stack,

    /// Dedicated stacks for interrupt, double-fault and NMI contexts.
    pub interrupt_stack: Stack,
    pub double_fault_stack: Stack,
    pub nmi_stack: Stack,
}

impl Executor {
    #[must_use]
    pub const fn new(id: CpuId, lapic_id: u32) -> Self {
        Self {
            cpu: CpuLocal::new(id),
            lapic_id,
            current_task: AtomicPtr::new(core::ptr::null_mut()),
            kernel_stack: Stack::empty(),
            interrupt_stack: Stack::empty(),
            double_fault_stack: Stack::empty(),
            nmi_stack: Stack::empty(),
        }
    }

    /// The executor the calling CPU belongs to.
    ///
    /// Valid once [`install`](Self::install) has run on this CPU; the
    /// result is stable only while interrupts are disabled.
    #[must_use]
    pub fn current() -> &'static Executor {
        let cpu = arch::current_cpu();
        // Safety: every CpuLocal handed to set_current_cpu lives at
        // offset 0 of an Executor.
        unsafe { &*core::ptr::from_ref::<CpuLocal>(cpu).cast::<Executor>() }
    }

    /// Point the per-CPU register at this executor.
    ///
    /// # Safety
    /// Must run on the CPU this executor describes, with interrupts
    /// disabled, and `self` must live for the rest of the kernel's
    /// lifetime.
    pub unsafe fn install(&'static self) {
        unsafe { arch::set_current_cpu(&self.cpu) };
    }
}
