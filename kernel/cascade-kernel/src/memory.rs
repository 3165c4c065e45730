//! Kernel-wide memory singletons: the physical page allocator, the core
//! page table and the two direct maps. All are created during stage 1 and
//! never torn down.

use cascade_addresses::DirectMap;
use cascade_arch::paging::PageTable;
use cascade_pmm::PhysicalPageAllocator;
use cascade_sync::{SyncOnceCell, TicketSpinLock};

static PMM: SyncOnceCell<PhysicalPageAllocator> = SyncOnceCell::new();
static KERNEL_PAGE_TABLE: SyncOnceCell<TicketSpinLock<PageTable>> = SyncOnceCell::new();
static DIRECT_MAP: SyncOnceCell<DirectMap> = SyncOnceCell::new();
static NON_CACHED_DIRECT_MAP: SyncOnceCell<DirectMap> = SyncOnceCell::new();

pub fn set_direct_maps(cached: DirectMap, non_cached: DirectMap) {
    DIRECT_MAP.set(cached).expect("direct map set twice");
    NON_CACHED_DIRECT_MAP
        .set(non_cached)
        .expect("non-cached direct map set twice");
}

/// The cacheable direct map of physical memory.
pub fn direct_map() -> &'static DirectMap {
    DIRECT_MAP.get().expect("direct map queried before stage 1")
}

/// The uncached alias of the direct map, for MMIO.
pub fn non_cached_direct_map() -> &'static DirectMap {
    NON_CACHED_DIRECT_MAP
        .get()
        .expect("non-cached direct map queried before stage 1")
}

pub fn set_pmm(pmm: PhysicalPageAllocator) {
    PMM.set(pmm).ok().expect("physical allocator set twice");
}

/// The kernel's physical page allocator.
pub fn pmm() -> &'static PhysicalPageAllocator {
    PMM.get().expect("physical allocator queried before stage 1")
}

pub fn set_kernel_page_table(table: PageTable) {
    KERNEL_PAGE_TABLE
        .set(TicketSpinLock::new(table))
        .ok()
        .expect("kernel page table set twice");
}

/// The core page table shared by every executor.
pub fn kernel_page_table() -> &'static TicketSpinLock<PageTable> {
    KERNEL_PAGE_TABLE
        .get()
        .expect("kernel page table queried before stage 1")
}
