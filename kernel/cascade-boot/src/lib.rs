//! # Boot protocol projection
//!
//! The kernel consumes a Limine-compatible handoff: the HHDM offset, the
//! memory map, the CPU descriptor list and the RSDP address. This crate
//! turns the bootloader's view into the kernel's own types (a
//! [`DirectMap`], [`MemoryRegion`]s with the four-valued kind the
//! allocators care about) and pins down the fixed virtual-memory layout
//! the kernel builds during stage 1.

#![cfg_attr(target_os = "none", no_std)]

pub mod layout;
mod memory_map;

pub use memory_map::{MemoryCensus, MemoryRegion, MemoryRegionKind, census, project, trace_memory_map};

use cascade_addresses::{DirectMap, VirtualAddress, align_up};
use limine::memory_map::Entry;

/// Build the cacheable [`DirectMap`] from the bootloader's HHDM offset.
///
/// The window is sized to the highest physical address present in the
/// memory map (rounded up to a page, since the map may end unaligned),
/// so every translation of mapped RAM lands inside it.
#[must_use]
pub fn direct_map_from_hhdm(hhdm_offset: u64, entries: &[&Entry]) -> DirectMap {
    let highest = entries
        .iter()
        .map(|entry| entry.base + entry.length)
        .max()
        .unwrap_or(0);
    DirectMap::new(VirtualAddress::new(hhdm_offset), align_up(highest, 4096))
}

/// The uncached twin of the direct map, laid out identically at
/// [`layout::NON_CACHED_DIRECT_MAP_BASE`]. Stage 1 maps it with the
/// device memory type; MMIO goes through here.
#[must_use]
pub fn non_cached_direct_map(cached: DirectMap) -> DirectMap {
    DirectMap::new(
        VirtualAddress::new(layout::NON_CACHED_DIRECT_MAP_BASE),
        cached.size(),
    )
}
