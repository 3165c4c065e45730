//! Hosted (test) implementation of the CPU-control surface.
//!
//! Each `std` thread is treated as its own CPU: the first call to
//! [`current_cpu`] on a thread leaks a fresh [`CpuLocal`] with the next
//! sequential id. The interrupt flag is a thread-local boolean, so tests
//! can assert the masking behavior of exclusion tokens and locks without
//! hardware.

use crate::{CpuId, CpuLocal};
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_CPU_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CURRENT_CPU: Cell<*const CpuLocal> = const { Cell::new(ptr::null()) };
}

#[inline]
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

#[inline]
pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
}

#[inline]
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));
}

pub fn disable_and_halt() -> ! {
    panic!("disable_and_halt() reached in a hosted build");
}

pub unsafe fn set_current_cpu(cpu: *const CpuLocal) {
    CURRENT_CPU.with(|current| current.set(cpu));
}

pub fn current_cpu() -> &'static CpuLocal {
    CURRENT_CPU.with(|current| {
        let mut ptr = current.get();
        if ptr.is_null() {
            let id = CpuId::new(NEXT_CPU_ID.fetch_add(1, Ordering::Relaxed));
            ptr = Box::leak(Box::new(CpuLocal::new(id)));
            current.set(ptr);
        }
        unsafe { &*ptr }
    })
}
