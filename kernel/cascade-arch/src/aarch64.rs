//! AArch64 implementation of the CPU-control surface.
//!
//! IRQ masking uses the `I` bit of `DAIF`; the per-CPU record pointer is
//! kept in `TPIDR_EL1`.

use crate::CpuLocal;
use core::arch::asm;

const DAIF_IRQ: u64 = 1 << 7;

#[inline]
pub fn interrupts_enabled() -> bool {
    let daif: u64;
    unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags)) }
    daif & DAIF_IRQ == 0
}

#[inline]
pub fn disable_interrupts() {
    unsafe { asm!("msr daifset, #2", options(nomem, nostack, preserves_flags)) }
}

#[inline]
pub fn enable_interrupts() {
    unsafe { asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags)) }
}

pub fn disable_and_halt() -> ! {
    loop {
        unsafe { asm!("msr daifset, #2; wfi", options(nomem, nostack)) }
    }
}

pub unsafe fn set_current_cpu(cpu: *const CpuLocal) {
    unsafe { asm!("msr tpidr_el1, {}", in(reg) cpu as u64, options(nomem, nostack, preserves_flags)) }
}

#[inline]
pub fn current_cpu() -> &'static CpuLocal {
    let ptr: u64;
    unsafe { asm!("mrs {}, tpidr_el1", out(reg) ptr, options(nomem, nostack, preserves_flags)) }
    let ptr = ptr as *const CpuLocal;
    assert!(!ptr.is_null(), "per-CPU register is unset");
    unsafe { &*ptr }
}
