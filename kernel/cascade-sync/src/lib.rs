//! # Kernel synchronization primitives
//!
//! Layered bottom-up:
//!
//! 1. [`PreemptionExclusion`] / [`InterruptExclusion`]: per-CPU,
//!    refcount-nested tokens that pin the caller to its CPU and mask
//!    preemption and/or interrupts.
//! 2. [`TicketSpinLock`]: FIFO-fair mutual exclusion on top of the
//!    combined token; safe to take from interrupt context.
//! 3. [`Mutex`]: the same ticket discipline with preemption-only
//!    exclusion, for code that never runs in interrupt context. This is
//!    the seam where a scheduler-blocking mutex slots in later.
//! 4. [`SyncOnceCell`]: one-time initialization for kernel-wide
//!    registries.
//! 5. [`Rendezvous`]: the release/acquire counter the SMP bring-up
//!    barrier is built from.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

mod exclusion;
mod mutex;
mod rendezvous;
mod sync_once_cell;
mod ticket;

pub use exclusion::{InterruptExclusion, PreemptionExclusion, PreemptionInterruptExclusion};
pub use mutex::{Mutex, MutexGuard};
pub use rendezvous::Rendezvous;
pub use sync_once_cell::SyncOnceCell;
pub use ticket::{TicketGuard, TicketSpinLock};
