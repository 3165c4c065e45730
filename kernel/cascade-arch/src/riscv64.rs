//! RISC-V 64 implementation of the CPU-control surface.
//!
//! Supervisor interrupt masking uses the `SIE` bit of `sstatus`; the
//! per-CPU record pointer is kept in `sscratch`.

use crate::CpuLocal;
use core::arch::asm;

const SSTATUS_SIE: u64 = 1 << 1;

#[inline]
pub fn interrupts_enabled() -> bool {
    let sstatus: u64;
    unsafe { asm!("csrr {}, sstatus", out(reg) sstatus, options(nomem, nostack, preserves_flags)) }
    sstatus & SSTATUS_SIE != 0
}

#[inline]
pub fn disable_interrupts() {
    unsafe { asm!("csrci sstatus, 0b10", options(nomem, nostack, preserves_flags)) }
}

#[inline]
pub fn enable_interrupts() {
    unsafe { asm!("csrsi sstatus, 0b10", options(nomem, nostack, preserves_flags)) }
}

pub fn disable_and_halt() -> ! {
    loop {
        unsafe { asm!("csrci sstatus, 0b10; wfi", options(nomem, nostack)) }
    }
}

pub unsafe fn set_current_cpu(cpu: *const CpuLocal) {
    unsafe { asm!("csrw sscratch, {}", in(reg) cpu as u64, options(nomem, nostack, preserves_flags)) }
}

#[inline]
pub fn current_cpu() -> &'static CpuLocal {
    let ptr: u64;
    unsafe { asm!("csrr {}, sscratch", out(reg) ptr, options(nomem, nostack, preserves_flags)) }
    let ptr = ptr as *const CpuLocal;
    assert!(!ptr.is_null(), "per-CPU register is unset");
    unsafe { &*ptr }
}
