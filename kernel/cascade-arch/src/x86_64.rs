//! x86-64 implementation of the CPU-control surface.
//!
//! Interrupt masking uses `cli`/`sti` with the `IF` bit of `RFLAGS`
//! (read via `pushfq`/`pop`) as the observable state. The per-CPU record
//! pointer lives in `IA32_KERNEL_GS_BASE`, matching the kernel's use of
//! `swapgs`-free supervisor-only access during early bring-up.

use crate::CpuLocal;
use core::arch::asm;

/// `IF` bit of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// MSR holding the kernel-private GS base.
const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

#[inline]
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    unsafe { asm!("pushfq; pop {}", out(reg) rflags, options(nostack, preserves_flags)) }
    rflags & RFLAGS_IF != 0
}

#[inline]
pub fn disable_interrupts() {
    unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) }
}

#[inline]
pub fn enable_interrupts() {
    unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) }
}

pub fn disable_and_halt() -> ! {
    loop {
        unsafe { asm!("cli; hlt", options(nomem, nostack)) }
    }
}

pub unsafe fn set_current_cpu(cpu: *const CpuLocal) {
    let value = cpu as u64;
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") IA32_KERNEL_GS_BASE,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[inline]
pub fn current_cpu() -> &'static CpuLocal {
    let low: u32;
    let high: u32;
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") IA32_KERNEL_GS_BASE,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    let ptr = ((u64::from(high) << 32) | u64::from(low)) as *const CpuLocal;
    assert!(!ptr.is_null(), "per-CPU register is unset");
    unsafe { &*ptr }
}

/// Load a new root page table (CR3 write). Flushes all non-global TLB
/// entries as an architectural side effect.
///
/// # Safety
/// `root` must be the physical address of a valid top-level page table
/// that maps the currently executing code.
pub unsafe fn load_page_table(root: u64) {
    unsafe { asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags)) }
}
