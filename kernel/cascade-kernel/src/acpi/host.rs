//! Host callbacks for the embedded ACPI interpreter.
//!
//! The interpreter is foreign C-style code: it sees a table of plain
//! function pointers and opaque context values, never a Rust type. Each
//! callback is a narrow adapter that re-enters the kernel's own
//! abstractions: the direct map, port I/O, the lock types, the vector
//! arena and the TSC timebase.

use crate::arch_x86;
use crate::memory;
use crate::time;
use cascade_arch as arch;
use cascade_addresses::PhysicalAddress;
use cascade_arena::{AllocationPolicy, Arena};
use cascade_sync::{Mutex, TicketSpinLock};
use core::ffi::c_void;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use log::debug;

/// Opaque handle crossing the C boundary.
pub type AcpiHandle = *mut c_void;

/// Interrupt handler signature expected from the interpreter.
pub type AcpiIrqHandler = unsafe extern "C" fn(context: AcpiHandle);

/// The interpreter's "wait forever" mutex timeout.
const ACPI_WAIT_FOREVER: u16 = 0xFFFF;

/// PCI function address as the interpreter spells it.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// The full host surface handed to the interpreter.
#[repr(C)]
pub struct AcpiHostOps {
    pub map: unsafe extern "C" fn(phys: u64, len: u64) -> *mut u8,
    pub unmap: unsafe extern "C" fn(virt: *mut u8, len: u64),
    pub pci_read: unsafe extern "C" fn(address: PciAddress, offset: u16, width: u8) -> u32,
    pub pci_write: unsafe extern "C" fn(address: PciAddress, offset: u16, width: u8, value: u32),
    pub io_read: unsafe extern "C" fn(port: u16, width: u8) -> u32,
    pub io_write: unsafe extern "C" fn(port: u16, width: u8, value: u32),
    pub create_mutex: extern "C" fn() -> AcpiHandle,
    pub acquire_mutex: unsafe extern "C" fn(mutex: AcpiHandle, timeout_ms: u16) -> bool,
    pub release_mutex: unsafe extern "C" fn(mutex: AcpiHandle),
    pub create_spinlock: extern "C" fn() -> AcpiHandle,
    pub lock_spinlock: unsafe extern "C" fn(lock: AcpiHandle),
    pub unlock_spinlock: unsafe extern "C" fn(lock: AcpiHandle),
    pub install_interrupt_handler:
        unsafe extern "C" fn(gsi: u32, handler: AcpiIrqHandler, context: AcpiHandle) -> u8,
    pub nanoseconds_since_boot: extern "C" fn() -> u64,
}

/// The one host table; its address is what the interpreter receives.
pub static HOST_OPS: AcpiHostOps = AcpiHostOps {
    map: host_map,
    unmap: host_unmap,
    pci_read: host_pci_read,
    pci_write: host_pci_write,
    io_read: host_io_read,
    io_write: host_io_write,
    create_mutex: host_create_mutex,
    acquire_mutex: host_acquire_mutex,
    release_mutex: host_release_mutex,
    create_spinlock: host_create_spinlock,
    lock_spinlock: host_lock_spinlock,
    unlock_spinlock: host_unlock_spinlock,
    install_interrupt_handler: host_install_interrupt_handler,
    nanoseconds_since_boot: host_nanoseconds_since_boot,
};

extern "C" fn host_nanoseconds_since_boot() -> u64 {
    time::nanoseconds_since_boot()
}

/// Vector space handed out to interpreter IRQ installs: an arena over the
/// architectural range left after exceptions and fixed kernel vectors.
static VECTOR_ARENA: Arena = Arena::new("interrupt_vectors", 1, None);

const FIRST_DYNAMIC_VECTOR: usize = 0x30;
const DYNAMIC_VECTOR_COUNT: usize = 0xC0;

/// ECAM (memory-mapped PCI configuration) base, from the MCFG table.
static PCI_ECAM_BASE: AtomicU64 = AtomicU64::new(0);

struct IrqSlot {
    handler: AtomicPtr<c_void>,
    context: AtomicPtr<c_void>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: IrqSlot = IrqSlot {
    handler: AtomicPtr::new(core::ptr::null_mut()),
    context: AtomicPtr::new(core::ptr::null_mut()),
};

static IRQ_SLOTS: [IrqSlot; 256] = [EMPTY_SLOT; 256];

/// Seed the vector arena. Called once ACPI discovery succeeds.
pub(super) fn init() {
    VECTOR_ARENA
        .add_span(FIRST_DYNAMIC_VECTOR, DYNAMIC_VECTOR_COUNT)
        .expect("seeding the interrupt-vector arena");
}

/// Record the ECAM window once the MCFG has been parsed.
pub fn set_pci_ecam_base(base: PhysicalAddress) {
    PCI_ECAM_BASE.store(base.as_u64(), Ordering::Release);
}

/// Invoked by the interrupt dispatch path for dynamically installed
/// vectors; relays to the interpreter's handler. Exported by symbol so
/// the vector stubs can reach it.
#[unsafe(no_mangle)]
pub extern "C" fn acpi_vector_dispatch(vector: u8) {
    let slot = &IRQ_SLOTS[vector as usize];
    let handler = slot.handler.load(Ordering::Acquire);
    if handler.is_null() {
        return;
    }
    let handler: AcpiIrqHandler = unsafe { core::mem::transmute(handler) };
    unsafe { handler(slot.context.load(Ordering::Acquire)) };
}

unsafe extern "C" fn host_map(phys: u64, _len: u64) -> *mut u8 {
    // The uncached direct map covers all physical memory; mapping is a
    // translation, not a page-table operation.
    memory::non_cached_direct_map()
        .virtual_from_physical(PhysicalAddress::new(phys))
        .as_ptr()
}

unsafe extern "C" fn host_unmap(_virt: *mut u8, _len: u64) {
    // Direct-map translations are permanent.
}

fn pci_config_ptr(address: PciAddress, offset: u16) -> *mut u8 {
    let ecam = PCI_ECAM_BASE.load(Ordering::Acquire);
    debug_assert!(ecam != 0, "PCI access before the ECAM base is known");
    let function_base = ecam
        + (u64::from(address.bus) << 20)
        + (u64::from(address.device) << 15)
        + (u64::from(address.function) << 12);
    let virt = memory::non_cached_direct_map()
        .virtual_from_physical(PhysicalAddress::new(function_base + u64::from(offset)));
    virt.as_ptr()
}

unsafe extern "C" fn host_pci_read(address: PciAddress, offset: u16, width: u8) -> u32 {
    let ptr = pci_config_ptr(address, offset);
    unsafe {
        match width {
            1 => u32::from(ptr.read_volatile()),
            2 => u32::from(ptr.cast::<u16>().read_volatile()),
            4 => ptr.cast::<u32>().read_volatile(),
            _ => unreachable!("unsupported PCI access width {width}"),
        }
    }
}

unsafe extern "C" fn host_pci_write(address: PciAddress, offset: u16, width: u8, value: u32) {
    let ptr = pci_config_ptr(address, offset);
    unsafe {
        match width {
            1 => ptr.write_volatile(value as u8),
            2 => ptr.cast::<u16>().write_volatile(value as u16),
            4 => ptr.cast::<u32>().write_volatile(value),
            _ => unreachable!("unsupported PCI access width {width}"),
        }
    }
}

unsafe extern "C" fn host_io_read(port: u16, width: u8) -> u32 {
    unsafe {
        match width {
            1 => u32::from(arch_x86::inb(port)),
            2 => u32::from(arch_x86::inw(port)),
            4 => arch_x86::inl(port),
            _ => unreachable!("unsupported port width {width}"),
        }
    }
}

unsafe extern "C" fn host_io_write(port: u16, width: u8, value: u32) {
    unsafe {
        match width {
            1 => arch_x86::outb(port, value as u8),
            2 => arch_x86::outw(port, value as u16),
            4 => arch_x86::outl(port, value),
            _ => unreachable!("unsupported port width {width}"),
        }
    }
}

extern "C" fn host_create_mutex() -> AcpiHandle {
    let mutex: &'static Mutex<()> = alloc::boxed::Box::leak(alloc::boxed::Box::new(Mutex::new(())));
    core::ptr::from_ref(mutex).cast_mut().cast()
}

unsafe extern "C" fn host_acquire_mutex(mutex: AcpiHandle, timeout_ms: u16) -> bool {
    // Finite waits need the scheduler's timed-wakeup machinery; until it
    // exists only infinite waits are honest.
    assert_eq!(
        timeout_ms, ACPI_WAIT_FOREVER,
        "finite ACPI mutex timeouts are not supported"
    );
    let mutex = unsafe { &*mutex.cast::<Mutex<()>>() };
    core::mem::forget(mutex.lock());
    true
}

unsafe extern "C" fn host_release_mutex(mutex: AcpiHandle) {
    let mutex = unsafe { &*mutex.cast::<Mutex<()>>() };
    unsafe { mutex.unlock_unchecked() };
    // Rebalance the exclusion the forgotten guard carried.
    arch::current_cpu()
        .preemption_disable_count
        .fetch_sub(1, Ordering::Relaxed);
}

extern "C" fn host_create_spinlock() -> AcpiHandle {
    let lock: &'static TicketSpinLock<()> =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(TicketSpinLock::new(())));
    core::ptr::from_ref(lock).cast_mut().cast()
}

unsafe extern "C" fn host_lock_spinlock(lock: AcpiHandle) {
    let lock = unsafe { &*lock.cast::<TicketSpinLock<()>>() };
    core::mem::forget(lock.lock());
}

unsafe extern "C" fn host_unlock_spinlock(lock: AcpiHandle) {
    let lock = unsafe { &*lock.cast::<TicketSpinLock<()>>() };
    unsafe { lock.unsafe_release() };
    // Rebalance the combined exclusion the forgotten guard carried.
    let cpu = arch::current_cpu();
    cpu.preemption_disable_count.fetch_sub(1, Ordering::Relaxed);
    if cpu.interrupt_disable_count.fetch_sub(1, Ordering::Relaxed) == 1 {
        arch::enable_interrupts();
    }
}

unsafe extern "C" fn host_install_interrupt_handler(
    gsi: u32,
    handler: AcpiIrqHandler,
    context: AcpiHandle,
) -> u8 {
    let vector = VECTOR_ARENA
        .allocate(1, AllocationPolicy::InstantFit)
        .expect("interrupt vector space exhausted")
        .base as u8;

    let slot = &IRQ_SLOTS[vector as usize];
    slot.context.store(context, Ordering::Relaxed);
    slot.handler
        .store(handler as usize as *mut c_void, Ordering::Release);

    // The I/O APIC driver consumes this pairing when it programs the
    // redirection entry for `gsi`.
    debug!("ACPI IRQ: GSI {gsi} -> vector {vector:#x}");
    vector
}
