//! Memory-map projection and accounting.

use cascade_addresses::{PhysicalAddress, PhysicalRange};
use limine::memory_map::{Entry, EntryType};
use log::info;

/// The kernel's four-valued view of a memory-map entry.
///
/// The bootloader distinguishes eight entry types; the allocators only
/// care about these four.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Usable RAM, handed to the physical page allocator.
    Free,
    /// RAM occupied by the kernel image, modules or the framebuffer.
    InUse,
    /// Firmware-owned or defective; never touched.
    ReservedOrUnusable,
    /// Reclaimable once the bootloader/ACPI data has been consumed.
    Reclaimable,
}

impl From<EntryType> for MemoryRegionKind {
    fn from(entry_type: EntryType) -> Self {
        if entry_type == EntryType::USABLE {
            Self::Free
        } else if entry_type == EntryType::EXECUTABLE_AND_MODULES
            || entry_type == EntryType::FRAMEBUFFER
        {
            Self::InUse
        } else if entry_type == EntryType::ACPI_RECLAIMABLE
            || entry_type == EntryType::BOOTLOADER_RECLAIMABLE
        {
            Self::Reclaimable
        } else {
            // RESERVED, ACPI_NVS, BAD_MEMORY and anything newer.
            Self::ReservedOrUnusable
        }
    }
}

/// One projected memory-map region.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub range: PhysicalRange,
    pub kind: MemoryRegionKind,
}

/// Project the bootloader's entries into [`MemoryRegion`]s, skipping
/// zero-length entries.
pub fn project<'a>(entries: &'a [&'a Entry]) -> impl Iterator<Item = MemoryRegion> + 'a {
    entries
        .iter()
        .filter(|entry| entry.length > 0)
        .map(|entry| MemoryRegion {
            range: PhysicalRange::new(PhysicalAddress::new(entry.base), entry.length),
            kind: MemoryRegionKind::from(entry.entry_type),
        })
}

/// Totals of the projected memory map.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryCensus {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub reclaimable_bytes: u64,
}

/// Walk the memory map and total the byte counts per kind.
#[must_use]
pub fn census(entries: &[&Entry]) -> MemoryCensus {
    let mut totals = MemoryCensus::default();
    for region in project(entries) {
        totals.total_bytes += region.range.size();
        match region.kind {
            MemoryRegionKind::Free => totals.free_bytes += region.range.size(),
            MemoryRegionKind::Reclaimable => totals.reclaimable_bytes += region.range.size(),
            MemoryRegionKind::InUse | MemoryRegionKind::ReservedOrUnusable => {}
        }
    }
    totals
}

/// Log the projected memory map, one line per region.
pub fn trace_memory_map(entries: &[&Entry]) {
    for region in project(entries) {
        info!(
            "memory map: {} {:?}",
            region.range, region.kind
        );
    }
    let totals = census(entries);
    info!(
        "memory map: {} MiB total, {} MiB free, {} MiB reclaimable",
        totals.total_bytes / (1024 * 1024),
        totals.free_bytes / (1024 * 1024),
        totals.reclaimable_bytes / (1024 * 1024),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_types_project_to_four_kinds() {
        assert_eq!(
            MemoryRegionKind::from(EntryType::USABLE),
            MemoryRegionKind::Free
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::EXECUTABLE_AND_MODULES),
            MemoryRegionKind::InUse
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::FRAMEBUFFER),
            MemoryRegionKind::InUse
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::ACPI_RECLAIMABLE),
            MemoryRegionKind::Reclaimable
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::BOOTLOADER_RECLAIMABLE),
            MemoryRegionKind::Reclaimable
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::RESERVED),
            MemoryRegionKind::ReservedOrUnusable
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::ACPI_NVS),
            MemoryRegionKind::ReservedOrUnusable
        );
        assert_eq!(
            MemoryRegionKind::from(EntryType::BAD_MEMORY),
            MemoryRegionKind::ReservedOrUnusable
        );
    }
}
