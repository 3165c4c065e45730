//! # Physical memory manager
//!
//! A deliberately single-class allocator: one ticket-spinlock-protected
//! LIFO of free 4 KiB page frames, fed from the bootloader's memory map.
//! Each free frame stores its own list node in its first bytes, reached
//! through the direct map, so the allocator needs no metadata storage of
//! its own.
//!
//! Higher-level structure (contiguous runs, typed caches, address-space
//! carving) is layered on top with resource arenas rather than built in
//! here.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

use cascade_addresses::{DirectMap, PhysicalAddress, PhysicalRange, VirtualAddress};
use cascade_arch::STANDARD_PAGE_SIZE;
use cascade_arch::paging::FrameSource;
use cascade_collections::{SingleNode, SinglyLinkedList};
use cascade_sync::TicketSpinLock;
use core::fmt;

const PAGE_SIZE: u64 = STANDARD_PAGE_SIZE as u64;

/// Error from [`PhysicalPageAllocator::add_range`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddRangeError {
    /// Base or size is not a multiple of the standard page size.
    InvalidRange,
}

impl fmt::Display for AddRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => f.write_str("range is not page aligned"),
        }
    }
}

/// Error from [`PhysicalPageAllocator::allocate_page`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfPhysicalMemory;

impl fmt::Display for OutOfPhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of physical memory")
    }
}

/// The kernel's page-frame allocator.
///
/// # Invariants
/// - Every node on the free list is page aligned and lies within a range
///   previously handed to [`add_range`](Self::add_range), hence within
///   the direct map.
/// - The list is only touched under the spinlock; operations never block
///   on anything else.
pub struct PhysicalPageAllocator {
    direct_map: DirectMap,
    free_list: TicketSpinLock<SinglyLinkedList>,
}

impl PhysicalPageAllocator {
    #[must_use]
    pub const fn new(direct_map: DirectMap) -> Self {
        Self {
            direct_map,
            free_list: TicketSpinLock::new(SinglyLinkedList::new()),
        }
    }

    /// The direct map this allocator translates through.
    #[must_use]
    pub const fn direct_map(&self) -> DirectMap {
        self.direct_map
    }

    /// Feed a range of free physical memory to the allocator.
    ///
    /// Both base and size must be multiples of the standard page size; a
    /// list node is written at the start of every page.
    ///
    /// # Safety
    /// `range` must be unused RAM, reachable through this allocator's
    /// direct map, and must not already be on the free list.
    pub unsafe fn add_range(&self, range: PhysicalRange) -> Result<(), AddRangeError> {
        if !range.address().is_aligned(PAGE_SIZE) || range.size() % PAGE_SIZE != 0 {
            return Err(AddRangeError::InvalidRange);
        }

        let virt = self.direct_map.virtual_range(range);
        let mut list = self.free_list.lock();
        let mut offset = 0;
        while offset < virt.size() {
            let node: *mut SingleNode = (virt.address() + offset).as_ptr();
            unsafe {
                node.write(SingleNode::new());
                list.push(core::ptr::NonNull::new_unchecked(node));
            }
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Allocate one page frame.
    pub fn allocate_page(&self) -> Result<PhysicalRange, OutOfPhysicalMemory> {
        let node = self.free_list.lock().pop().ok_or(OutOfPhysicalMemory)?;
        let virt = VirtualAddress::from_ptr(node.as_ptr());
        let addr = self.direct_map.physical_from_virtual(virt);
        debug_assert!(addr.is_aligned(PAGE_SIZE));
        Ok(PhysicalRange::new(addr, PAGE_SIZE))
    }

    /// Return a page frame obtained from [`allocate_page`](Self::allocate_page).
    ///
    /// # Panics
    /// Panics if the range is not exactly one aligned page.
    pub fn deallocate_page(&self, range: PhysicalRange) {
        assert!(
            range.address().is_aligned(PAGE_SIZE),
            "deallocated page is unaligned: {range}"
        );
        assert_eq!(
            range.size(),
            PAGE_SIZE,
            "deallocated range is not a single page: {range}"
        );

        let node: *mut SingleNode = self
            .direct_map
            .virtual_from_physical(range.address())
            .as_ptr();
        unsafe {
            node.write(SingleNode::new());
            self.free_list
                .lock()
                .push(core::ptr::NonNull::new_unchecked(node));
        }
    }

    /// Number of frames currently on the free list.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.free_list.lock().len()
    }
}

impl FrameSource for PhysicalPageAllocator {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_page().ok().map(PhysicalRange::address)
    }

    fn deallocate_frame(&self, frame: PhysicalAddress) {
        self.deallocate_page(PhysicalRange::new(frame, PAGE_SIZE));
    }
}
