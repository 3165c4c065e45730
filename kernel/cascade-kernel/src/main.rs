//! # CascadeOS kernel entry
//!
//! Booted via the Limine protocol. The bootloader drops the bootstrap
//! processor into [`_start`] with the HHDM established and interrupts
//! disabled; `init::stage1` then runs the staged bring-up and parks every
//! executor in the idle loop.
//!
//! Everything below is gated on `target_os = "none"`: the kernel only
//! exists for the bare-metal target, and hosted builds (workspace checks,
//! test runs) reduce to an empty stub.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![allow(unsafe_code)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod acpi;
#[cfg(target_os = "none")]
mod arch_x86;
#[cfg(target_os = "none")]
mod executor;
#[cfg(target_os = "none")]
mod heap;
#[cfg(target_os = "none")]
mod init;
#[cfg(target_os = "none")]
mod logger;
#[cfg(target_os = "none")]
mod memory;
#[cfg(target_os = "none")]
mod task;
#[cfg(target_os = "none")]
mod time;

#[cfg(target_os = "none")]
mod requests {
    use limine::BaseRevision;
    use limine::request::{
        ExecutableAddressRequest, HhdmRequest, MemoryMapRequest, MpRequest, RequestsEndMarker,
        RequestsStartMarker, RsdpRequest,
    };

    #[used]
    #[unsafe(link_section = ".requests_start_marker")]
    static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    /// Base revision supported by this kernel.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static BASE_REVISION: BaseRevision = BaseRevision::new();

    /// Higher-half direct map offset.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    /// The physical memory map.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    /// Virtual and physical base of the kernel image.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest =
        ExecutableAddressRequest::new();

    /// CPU descriptor list with per-CPU boot hooks.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static MP_REQUEST: MpRequest = MpRequest::new();

    /// RSDP address for ACPI discovery.
    #[used]
    #[unsafe(link_section = ".requests")]
    pub static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

    #[used]
    #[unsafe(link_section = ".requests_end_marker")]
    static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();
}

/// Kernel entry point called by the bootloader on the bootstrap
/// processor, on a bootloader-provided stack with interrupts disabled.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    init::stage1()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Best effort: the logger works from the first moments of stage 1.
    log::error!("KERNEL PANIC: {info}");
    cascade_arch::disable_and_halt()
}

/// Hosted builds only type-check the kernel; there is nothing to run.
#[cfg(not(target_os = "none"))]
fn main() {}
