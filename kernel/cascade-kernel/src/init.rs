//! Staged SMP bring-up.
//!
//! Stage 1 runs once on the bootstrap processor and builds the world:
//! direct maps, physical allocator, core page table, ACPI roots, time,
//! heap, executor structs. Stage 2 runs on every executor and loads its
//! per-CPU state; stage 3 is the rendezvous that holds everyone until the
//! whole machine is up.
//!
//! Any error in any stage is fatal: the failing executor logs and halts
//! the CPU, there is no partial boot.

use crate::executor::{Executor, Stack};
use crate::task::Task;
use crate::requests::{
    BASE_REVISION, EXECUTABLE_ADDRESS_REQUEST, HHDM_REQUEST, MEMORY_MAP_REQUEST, MP_REQUEST,
    RSDP_REQUEST,
};
use crate::{acpi, arch_x86, heap, logger, memory, time};
use alloc::boxed::Box;
use alloc::vec::Vec;
use cascade_addresses::{PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange};
use cascade_arch::{self as arch, CpuId};
use cascade_arch::paging::{AddressSpace, CacheMode, MapType, PageTable};
use cascade_boot::layout::{INTERRUPT_STACK_SIZE, KERNEL_STACK_SIZE};
use cascade_boot::{MemoryRegionKind, census, project, trace_memory_map};
use cascade_pmm::PhysicalPageAllocator;
use cascade_sync::{Rendezvous, SyncOnceCell};
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use limine::memory_map::Entry;
use limine::mp::Cpu;
use log::{error, info, warn};

/// Milestones of the bootstrap processor's bring-up, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
enum BootstrapStage {
    EarlyOutput,
    OffsetsDetermined,
    CpuCaptured,
    PmmInitialized,
    PageTableLoaded,
    AcpiReady,
    TimeInitialized,
    HeapInitialized,
    StacksInitialized,
    ExecutorsConstructed,
    PeersStarted,
    BarrierComplete,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EarlyOutput => "early output",
            Self::OffsetsDetermined => "offsets determined",
            Self::CpuCaptured => "cpu captured",
            Self::PmmInitialized => "pmm initialized",
            Self::PageTableLoaded => "core page table loaded",
            Self::AcpiReady => "acpi ready",
            Self::TimeInitialized => "time initialized",
            Self::HeapInitialized => "heap initialized",
            Self::StacksInitialized => "stacks initialized",
            Self::ExecutorsConstructed => "executors constructed",
            Self::PeersStarted => "peers started",
            Self::BarrierComplete => "barrier complete",
        };
        f.write_str(name)
    }
}

static BOOTSTRAP_STAGE: AtomicU8 = AtomicU8::new(0);

/// Advance the bootstrap state machine; transitions are strictly
/// monotonic.
fn advance(stage: BootstrapStage) {
    let previous = BOOTSTRAP_STAGE.swap(stage as u8, Ordering::Release);
    assert!(previous <= stage as u8, "bootstrap stage went backwards");
    log::debug!("boot: {stage}");
}

/// Fatal bring-up error: log and halt this CPU.
fn fail(message: &str) -> ! {
    error!("boot failed: {message}");
    arch::disable_and_halt()
}

/// The statically allocated bootstrap executor.
static mut BOOTSTRAP_EXECUTOR: Executor = Executor::new(CpuId::new(0), 0);

fn bootstrap_executor() -> &'static mut Executor {
    // Safety: mutated only single-threaded during stage 1, before any
    // peer starts.
    unsafe { &mut *core::ptr::addr_of_mut!(BOOTSTRAP_EXECUTOR) }
}

/// Non-bootstrap executors, constructed during stage 1.
static EXECUTORS: SyncOnceCell<&'static [Executor]> = SyncOnceCell::new();

/// Total number of executors, bootstrap included.
static EXECUTOR_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Stage-3 rendezvous counter.
static READY: Rendezvous = Rendezvous::new();

/// Stage 1: bring the bootstrap processor and the kernel's substrate up,
/// then start the peers and rendezvous with them.
pub fn stage1() -> ! {
    logger::install();
    advance(BootstrapStage::EarlyOutput);
    info!("CascadeOS starting on the bootstrap processor");

    // Locks read the per-CPU register; point it at the bootstrap
    // executor before the first lock is touched.
    unsafe { bootstrap_executor_shared().install() };

    if !BASE_REVISION.is_supported() {
        fail("bootloader base revision is unsupported");
    }

    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        fail("bootloader provided no HHDM offset");
    };
    let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
        fail("bootloader provided no memory map");
    };
    let entries = memory_map.entries();

    let direct_map = cascade_boot::direct_map_from_hhdm(hhdm.offset(), entries);
    let non_cached = cascade_boot::non_cached_direct_map(direct_map);
    memory::set_direct_maps(direct_map, non_cached);
    advance(BootstrapStage::OffsetsDetermined);

    arch_x86::verify_long_mode();
    arch_x86::program_pat();
    arch_x86::disable_pic();
    advance(BootstrapStage::CpuCaptured);

    trace_memory_map(entries);
    initialize_physical_memory(entries);
    advance(BootstrapStage::PmmInitialized);

    build_and_load_core_page_table(entries);
    advance(BootstrapStage::PageTableLoaded);

    match RSDP_REQUEST.get_response() {
        Some(response) => acpi::init(PhysicalAddress::new(response.address() as u64)),
        None => warn!("bootloader provided no RSDP; ACPI is unavailable"),
    }
    advance(BootstrapStage::AcpiReady);

    time::init();
    advance(BootstrapStage::TimeInitialized);

    heap::init();
    advance(BootstrapStage::HeapInitialized);

    allocate_executor_stacks(bootstrap_executor());
    advance(BootstrapStage::StacksInitialized);

    let Some(mp) = MP_REQUEST.get_response() else {
        fail("bootloader provided no CPU descriptors");
    };
    let executors = construct_executors(mp);
    advance(BootstrapStage::ExecutorsConstructed);

    start_peers(mp, executors);
    advance(BootstrapStage::PeersStarted);

    unsafe { stage2(bootstrap_executor_shared()) };
    stage3(bootstrap_executor_shared(), true)
}

fn bootstrap_executor_shared() -> &'static Executor {
    bootstrap_executor()
}

fn initialize_physical_memory(entries: &[&Entry]) {
    let totals = census(entries);
    info!(
        "physical memory: {} MiB usable of {} MiB",
        totals.free_bytes / (1024 * 1024),
        totals.total_bytes / (1024 * 1024)
    );

    let pmm = PhysicalPageAllocator::new(*memory::direct_map());
    for region in project(entries) {
        if region.kind != MemoryRegionKind::Free {
            continue;
        }
        // Safety: the bootloader guarantees USABLE regions are unused,
        // page aligned, and covered by the HHDM.
        if let Err(err) = unsafe { pmm.add_range(region.range) } {
            error!("rejecting memory region {}: {err}", region.range);
            fail("memory map contains an invalid usable region");
        }
    }
    memory::set_pmm(pmm);
    cascade_arena::init_tag_pool(memory::pmm());
}

/// Build the kernel's own page table and switch to it.
///
/// Both direct maps cover all of physical memory (large pages wherever
/// alignment allows); the kernel image is mapped at its link address.
/// There is no rollback here: a mapping failure during init is fatal.
fn build_and_load_core_page_table(entries: &[&Entry]) {
    let pmm = memory::pmm();
    let direct_map = memory::direct_map();
    let non_cached = memory::non_cached_direct_map();

    let mut table = match PageTable::new(pmm, direct_map) {
        Ok(table) => table,
        Err(err) => {
            error!("allocating the root page table: {err}");
            fail("cannot construct the core page table");
        }
    };

    let physical = PhysicalRange::new(PhysicalAddress::zero(), direct_map.size());
    let mappings = [
        (direct_map.base(), MapType::kernel_data()),
        (non_cached.base(), MapType::device()),
    ];
    for (base, map_type) in mappings {
        if let Err(err) = table.map_range_all_page_sizes(
            pmm,
            direct_map,
            VirtualRange::new(base, direct_map.size()),
            physical,
            map_type,
        ) {
            error!("mapping the direct map at {base}: {err}");
            fail("cannot build the core page table");
        }
    }

    let Some(image) = EXECUTABLE_ADDRESS_REQUEST.get_response() else {
        fail("bootloader provided no kernel image addresses");
    };
    let image_map_type = MapType {
        writable: true,
        executable: true,
        user: false,
        global: true,
        cache: CacheMode::WriteBack,
    };
    for entry in entries {
        if entry.entry_type != limine::memory_map::EntryType::EXECUTABLE_AND_MODULES {
            continue;
        }
        if entry.base < image.physical_base() {
            // Modules below the image stay reachable through the direct
            // map; only the kernel proper needs its link address.
            continue;
        }
        let virt = VirtualAddress::new(
            image.virtual_base() + (entry.base - image.physical_base()),
        );
        if let Err(err) = table.map_range_all_page_sizes(
            pmm,
            direct_map,
            VirtualRange::new(virt, entry.length),
            PhysicalRange::new(PhysicalAddress::new(entry.base), entry.length),
            image_map_type,
        ) {
            error!("mapping the kernel image at {virt}: {err}");
            fail("cannot map the kernel image");
        }
    }

    memory::set_kernel_page_table(table);
    // Safety: the new table maps the executing code, the current stack
    // (through the direct map) and everything stage 1 still touches.
    unsafe { memory::kernel_page_table().lock().load() };
}

fn allocate_stack(size: usize) -> Stack {
    match heap::allocate(size) {
        Ok(base) => Stack::new(base, size),
        Err(err) => {
            error!("allocating a {size}-byte stack: {err}");
            fail("cannot allocate executor stacks");
        }
    }
}

/// Give an executor its interrupt-context stacks (and, for peers, the
/// kernel stack they will run on).
fn allocate_executor_stacks(executor: &mut Executor) {
    executor.interrupt_stack = allocate_stack(INTERRUPT_STACK_SIZE);
    executor.double_fault_stack = allocate_stack(INTERRUPT_STACK_SIZE);
    executor.nmi_stack = allocate_stack(INTERRUPT_STACK_SIZE);
}

/// Build one executor per non-bootstrap CPU descriptor.
fn construct_executors(mp: &limine::response::MpResponse) -> &'static [Executor] {
    let bsp_lapic_id = mp.bsp_lapic_id();
    bootstrap_executor().lapic_id = bsp_lapic_id;

    let mut executors = Vec::new();
    let mut next_id = 1u32;
    for cpu in mp.cpus() {
        if cpu.lapic_id == bsp_lapic_id {
            continue;
        }
        let mut executor = Executor::new(CpuId::new(next_id), cpu.lapic_id);
        executor.kernel_stack = allocate_stack(KERNEL_STACK_SIZE);
        allocate_executor_stacks(&mut executor);
        executors.push(executor);
        next_id += 1;
    }

    let executors: &'static [Executor] = executors.leak();
    EXECUTOR_COUNT.store(executors.len() + 1, Ordering::Release);
    EXECUTORS
        .set(executors)
        .ok()
        .expect("executors constructed twice");
    info!(
        "{} executor(s): bootstrap lapic {bsp_lapic_id}, {} peer(s)",
        executors.len() + 1,
        executors.len()
    );
    executors
}

/// Hand every non-bootstrap CPU its entry hook.
fn start_peers(mp: &limine::response::MpResponse, executors: &'static [Executor]) {
    let bsp_lapic_id = mp.bsp_lapic_id();
    for cpu in mp.cpus() {
        if cpu.lapic_id == bsp_lapic_id {
            continue;
        }
        debug_assert!(executors.iter().any(|e| e.lapic_id == cpu.lapic_id));
        cpu.goto_address.write(stage2_entry);
    }
}

/// First instruction of every non-bootstrap executor, via the
/// bootloader's boot hook. Arrives with interrupts disabled on a
/// bootloader stack.
extern "C" fn stage2_entry(cpu: &Cpu) -> ! {
    let executors = EXECUTORS
        .get()
        .expect("peer started before executors were constructed");
    let Some(executor) = executors.iter().find(|e| e.lapic_id == cpu.lapic_id) else {
        // No descriptor matched; nothing sane to do on this CPU.
        arch::disable_and_halt()
    };

    unsafe { stage2(executor) };
    stage3(executor, false)
}

/// Stage 2: adopt the core page table and install per-CPU state.
///
/// # Safety
/// Must run exactly once per executor, on the CPU it describes, with
/// interrupts disabled.
unsafe fn stage2(executor: &'static Executor) {
    unsafe {
        memory::kernel_page_table().lock().load();
        executor.install();
    }
}

/// Stage 3: rendezvous. Peers report ready and wait for the bootstrap's
/// completion signal; the bootstrap waits for every peer, announces the
/// kernel, and releases them.
fn stage3(executor: &'static Executor, bootstrap: bool) -> ! {
    // The code now running on this executor becomes its init task.
    let task = Box::leak(Box::new(Task::bootstrap(
        "init",
        executor.kernel_stack,
        executor,
    )));
    executor.current_task.store(task, Ordering::Release);

    let total = EXECUTOR_COUNT.load(Ordering::Acquire);
    if bootstrap {
        READY.wait_for(total - 1);
        info!("initialization complete: {total} executor(s) online");
        advance(BootstrapStage::BarrierComplete);
        READY.signal();
    } else {
        READY.signal();
        READY.wait_for(total);
        info!("executor {} online", executor.cpu.id);
    }
    idle()
}

/// Nothing scheduled yet: halt until an interrupt arrives.
fn idle() -> ! {
    loop {
        core::hint::spin_loop();
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}
