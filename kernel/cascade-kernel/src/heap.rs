//! The kernel heap: two stacked arenas and a `GlobalAlloc` front end.
//!
//! ```text
//! kernel_address_space arena   (quantum: one page; owns the heap VA window)
//!          ^ import: allocate VAs, back them with PMM pages, map them
//!          | release: unmap, free the pages, return the VAs
//! kernel_heap arena            (quantum: 16 bytes; hands out byte buffers)
//!          ^
//! GlobalAlloc (`Box`, `Vec`, ...) and the in-kernel byte-buffer API
//! ```
//!
//! Pressure propagates upward only when the heap arena runs out of mapped
//! space, in page-aligned imports.

use crate::memory;
use cascade_addresses::{PhysicalRange, VirtualAddress, VirtualRange};
use cascade_arch::STANDARD_PAGE_SIZE;
use cascade_arch::paging::{AddressSpace, FrameSource, MapType};
use cascade_arena::{AllocateError, Allocation, AllocationPolicy, Arena, Source};
use cascade_boot::layout::{KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

const PAGE: usize = STANDARD_PAGE_SIZE;

/// Grain of the byte-buffer arena; `GlobalAlloc` handles larger
/// alignments itself.
const HEAP_QUANTUM: usize = 16;

static KERNEL_ADDRESS_ARENA: Arena = Arena::new("kernel_address_space", PAGE, None);

static KERNEL_HEAP_ARENA: Arena = Arena::new(
    "kernel_heap",
    HEAP_QUANTUM,
    Some(Source::with_callbacks(
        &KERNEL_ADDRESS_ARENA,
        import_mapped,
        release_mapped,
    )),
);

/// Seed the address-space arena with the heap's virtual window.
///
/// After this returns, `alloc::` types work on every executor.
pub fn init() {
    KERNEL_ADDRESS_ARENA
        .add_span(KERNEL_HEAP_BASE as usize, KERNEL_HEAP_SIZE as usize)
        .expect("seeding the kernel address-space arena");
}

/// Allocate a byte buffer of at least `len` bytes, aligned to the heap
/// quantum.
pub fn allocate(len: usize) -> Result<VirtualAddress, AllocateError> {
    KERNEL_HEAP_ARENA
        .allocate(len, AllocationPolicy::BestFit)
        .map(|allocation| VirtualAddress::new(allocation.base as u64))
}

/// Free a buffer by the address [`allocate`] returned.
pub fn deallocate_base(address: VirtualAddress) {
    KERNEL_HEAP_ARENA.deallocate_base(address.as_usize());
}

/// Import callback: carve a virtual range out of the address-space arena
/// and back every page with freshly allocated, freshly mapped memory.
fn import_mapped(parent: &'static Arena, len: usize) -> Result<Allocation, AllocateError> {
    let len = len
        .checked_next_multiple_of(PAGE)
        .ok_or(AllocateError::RequestedLengthUnavailable)?;
    let virt = parent.allocate(len, AllocationPolicy::InstantFit)?;

    let pmm = memory::pmm();
    let direct_map = memory::direct_map();
    let mut table = memory::kernel_page_table().lock();

    let mut mapped = 0usize;
    while mapped < len {
        let page = VirtualAddress::new((virt.base + mapped) as u64);
        let result = pmm
            .allocate_page()
            .map_err(|_| AllocateError::RequestedLengthUnavailable)
            .and_then(|frame| {
                table
                    .map_range(
                        pmm as &dyn FrameSource,
                        direct_map,
                        VirtualRange::new(page, PAGE as u64),
                        frame,
                        MapType::kernel_data(),
                    )
                    .map_err(|_| {
                        pmm.deallocate_page(frame);
                        AllocateError::RequestedLengthUnavailable
                    })
            });

        if let Err(error) = result {
            // Unwind this import completely: nothing partial escapes.
            for offset in (0..mapped).step_by(PAGE) {
                let page = VirtualAddress::new((virt.base + offset) as u64);
                if let Some(frame) = table.unmap(direct_map, page) {
                    pmm.deallocate_page(PhysicalRange::new(frame, PAGE as u64));
                }
            }
            drop(table);
            parent.deallocate(virt);
            return Err(error);
        }
        mapped += PAGE;
    }
    Ok(virt)
}

/// Release callback: unmap the imported range, free its pages and return
/// the virtual range to the address-space arena.
fn release_mapped(parent: &'static Arena, allocation: Allocation) {
    let pmm = memory::pmm();
    let direct_map = memory::direct_map();

    {
        let mut table = memory::kernel_page_table().lock();
        for offset in (0..allocation.len).step_by(PAGE) {
            let page = VirtualAddress::new((allocation.base + offset) as u64);
            if let Some(frame) = table.unmap(direct_map, page) {
                crate::arch_x86::invlpg(page);
                pmm.deallocate_page(PhysicalRange::new(frame, PAGE as u64));
            }
        }
    }
    parent.deallocate(allocation);
}

/// The kernel's global allocator, backed by the heap arena.
struct KernelAllocator;

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= HEAP_QUANTUM {
            return match allocate(size) {
                Ok(address) => address.as_ptr(),
                Err(_) => ptr::null_mut(),
            };
        }

        // Over-aligned request: over-allocate and stash the arena base
        // one word below the aligned pointer for dealloc.
        let total = size + layout.align() + size_of::<usize>();
        match allocate(total) {
            Ok(address) => {
                let base = address.as_usize();
                let aligned = (base + size_of::<usize>()).next_multiple_of(layout.align());
                unsafe {
                    ((aligned - size_of::<usize>()) as *mut usize).write(base);
                }
                aligned as *mut u8
            }
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if layout.align() <= HEAP_QUANTUM {
            deallocate_base(VirtualAddress::from_ptr(ptr));
        } else {
            let base = unsafe { ((ptr as usize - size_of::<usize>()) as *const usize).read() };
            deallocate_base(VirtualAddress::new(base as u64));
        }
    }
}
