//! # Page mapping interface and x86-64 implementation
//!
//! The core only needs three things from the paging hardware: map a
//! virtual range to a physical range with the standard page size, map
//! opportunistically with larger pages during init, and load a root table.
//! [`AddressSpace`] captures that contract; [`PageTable`] implements it for
//! x86-64 four-level paging.
//!
//! ```text
//! VA = [PML4:9] [PDPT:9] [PD:9] [PT:9] [Offset:12]
//! ```
//!
//! Intermediate tables are allocated from a [`FrameSource`] and accessed
//! through the direct map. `map_range` never flushes the TLB; callers that
//! modify live mappings flush themselves. On failure a partially built
//! mapping is left in place; init either restarts or the table is
//! destroyed, per the boot-time contract.

use cascade_addresses::{DirectMap, PhysicalAddress, PhysicalRange, VirtualRange};
use core::fmt;

/// Cache policy for a mapping.
///
/// On x86-64 the three PAT selector bits are `[PAT2 : PCD : PWT]`; the PAT
/// is programmed during early boot so that index 6 (`0b110`) selects
/// write-combining.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheMode {
    /// Ordinary cacheable RAM.
    WriteBack,
    /// Uncacheable, for MMIO.
    Uncached,
    /// Write-combining, for framebuffers.
    WriteCombining,
}

/// What kind of mapping to establish.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapType {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub cache: CacheMode,
}

impl MapType {
    /// Kernel data: writable, non-executable, global.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self {
            writable: true,
            executable: false,
            user: false,
            global: true,
            cache: CacheMode::WriteBack,
        }
    }

    /// Kernel code: read-only, executable, global.
    #[must_use]
    pub const fn kernel_code() -> Self {
        Self {
            writable: false,
            executable: true,
            user: false,
            global: true,
            cache: CacheMode::WriteBack,
        }
    }

    /// Device memory: writable, uncached, non-executable.
    #[must_use]
    pub const fn device() -> Self {
        Self {
            writable: true,
            executable: false,
            user: false,
            global: true,
            cache: CacheMode::Uncached,
        }
    }
}

/// Failure modes of the mapping primitives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapError {
    /// The target virtual page already has a leaf mapping.
    AlreadyMapped,
    /// A huge mapping at a higher level covers the requested page, so the
    /// walk cannot descend further.
    MappingNotValid,
    /// A page-table frame could not be allocated.
    PhysicalMemoryExhausted,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => f.write_str("virtual range is already mapped"),
            Self::MappingNotValid => f.write_str("a larger mapping covers the requested range"),
            Self::PhysicalMemoryExhausted => f.write_str("out of physical memory for page tables"),
        }
    }
}

/// Supplier of 4 KiB physical frames for page-table structures.
///
/// Implemented by the physical page allocator; the paging code zeroes
/// frames itself before linking them into a table.
pub trait FrameSource {
    fn allocate_frame(&self) -> Option<PhysicalAddress>;
    fn deallocate_frame(&self, frame: PhysicalAddress);
}

/// The mapping capability the core depends on.
pub trait AddressSpace {
    /// Map `virt` to `phys` using only the standard page size.
    ///
    /// Both ranges must have equal size, aligned to the standard page
    /// size. Does not flush the TLB. On error the mapping may be partially
    /// established.
    fn map_range(
        &mut self,
        frames: &dyn FrameSource,
        direct_map: &DirectMap,
        virt: VirtualRange,
        phys: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError>;

    /// Init-time variant that opportunistically uses 2 MiB and 1 GiB
    /// pages where alignment permits. No rollback on failure; boot treats
    /// an error here as fatal.
    fn map_range_all_page_sizes(
        &mut self,
        frames: &dyn FrameSource,
        direct_map: &DirectMap,
        virt: VirtualRange,
        phys: PhysicalRange,
        map_type: MapType,
    ) -> Result<(), MapError>;
}

#[cfg(any(target_arch = "x86_64", not(target_os = "none")))]
pub use x86_64::PageTable;

#[cfg(any(target_arch = "x86_64", not(target_os = "none")))]
mod x86_64 {
    use super::{AddressSpace, CacheMode, FrameSource, MapError, MapType};
    use crate::STANDARD_PAGE_SIZE;
    use bitfield_struct::bitfield;
    use cascade_addresses::{DirectMap, PhysicalAddress, PhysicalRange, VirtualRange};

    const ENTRY_COUNT: usize = 512;
    const PAGE_4K: u64 = STANDARD_PAGE_SIZE as u64;
    const PAGE_2M: u64 = 2 * 1024 * 1024;
    const PAGE_1G: u64 = 1024 * 1024 * 1024;

    /// One x86-64 page-table entry, any level.
    ///
    /// Bit 7 is `PS` on non-terminal levels and the small-page PAT bit on
    /// PTEs; the large-page PAT bit (bit 12) overlaps the frame field and
    /// is handled explicitly in [`leaf`](Entry::leaf).
    #[bitfield(u64)]
    struct Entry {
        present: bool,
        writable: bool,
        user: bool,
        write_through: bool,
        cache_disable: bool,
        accessed: bool,
        dirty: bool,
        huge_or_pat: bool,
        global: bool,
        #[bits(3)]
        os_low: u8,
        #[bits(40)]
        frame: u64,
        #[bits(11)]
        os_high: u16,
        no_execute: bool,
    }

    impl Entry {
        fn address(self) -> PhysicalAddress {
            PhysicalAddress::new(self.frame() << 12)
        }

        /// Non-terminal entry pointing at the next-level table.
        ///
        /// Kept permissive (writable, user when needed); the leaf entry
        /// carries the effective permissions.
        fn table(next: PhysicalAddress, user: bool) -> Self {
            Self::new()
                .with_present(true)
                .with_writable(true)
                .with_user(user)
                .with_frame(next.as_u64() >> 12)
        }

        /// Terminal entry mapping a page of the given size.
        fn leaf(frame: PhysicalAddress, map_type: MapType, huge: bool) -> Self {
            let (write_through, cache_disable, pat2) = match map_type.cache {
                CacheMode::WriteBack => (false, false, false),
                CacheMode::Uncached => (false, true, false),
                // PAT index 6 = [PAT2:PCD:PWT] = 0b110, programmed as WC at boot.
                CacheMode::WriteCombining => (false, true, true),
            };
            let mut entry = Self::new()
                .with_present(true)
                .with_writable(map_type.writable)
                .with_user(map_type.user)
                .with_global(map_type.global)
                .with_no_execute(!map_type.executable)
                .with_write_through(write_through)
                .with_cache_disable(cache_disable)
                .with_frame(frame.as_u64() >> 12);
            if huge {
                entry.set_huge_or_pat(true);
                if pat2 {
                    // Large-page PAT bit.
                    entry = Self::from_bits(entry.into_bits() | 1 << 12);
                }
            } else {
                entry.set_huge_or_pat(pat2);
            }
            entry
        }
    }

    /// An x86-64 four-level address space rooted at a PML4 frame.
    pub struct PageTable {
        root: PhysicalAddress,
    }

    impl PageTable {
        /// Allocate and zero a fresh root table.
        pub fn new(
            frames: &dyn FrameSource,
            direct_map: &DirectMap,
        ) -> Result<Self, MapError> {
            let root = allocate_table(frames, direct_map)?;
            Ok(Self { root })
        }

        /// Adopt an existing root table (e.g. the bootloader's).
        ///
        /// # Safety
        /// `root` must be the physical address of a valid, 4 KiB aligned
        /// PML4 frame reachable through `direct_map`.
        #[must_use]
        pub const unsafe fn from_root(root: PhysicalAddress) -> Self {
            Self { root }
        }

        #[must_use]
        pub const fn root(&self) -> PhysicalAddress {
            self.root
        }

        /// Make this the active address space.
        ///
        /// # Safety
        /// The table must map the currently executing code and stack.
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        pub unsafe fn load(&self) {
            unsafe { crate::imp::load_page_table(self.root.as_u64()) }
        }

        /// Remove the 4 KiB leaf mapping of `virt`, returning the frame it
        /// pointed to. Intermediate tables are kept. Does not flush the
        /// TLB.
        ///
        /// Returns `None` if the page is not mapped with a 4 KiB leaf.
        pub fn unmap(
            &mut self,
            direct_map: &DirectMap,
            virt: cascade_addresses::VirtualAddress,
        ) -> Option<PhysicalAddress> {
            let va = virt.as_u64();
            debug_assert!(va % PAGE_4K == 0);
            let mut table = self.root;
            for level in (2..=4u32).rev() {
                let entry = read_entry(direct_map, table, index(va, level));
                if !entry.present() || entry.huge_or_pat() {
                    return None;
                }
                table = entry.address();
            }
            let idx = index(va, 1);
            let entry = read_entry(direct_map, table, idx);
            if !entry.present() {
                return None;
            }
            write_entry(direct_map, table, idx, Entry::new());
            Some(entry.address())
        }

        /// Walk the table and translate `virt`, mainly for assertions.
        #[must_use]
        pub fn translate(
            &self,
            direct_map: &DirectMap,
            virt: cascade_addresses::VirtualAddress,
        ) -> Option<PhysicalAddress> {
            let va = virt.as_u64();
            let mut table = self.root;
            for level in (1..=4u32).rev() {
                let entry = read_entry(direct_map, table, index(va, level));
                if !entry.present() {
                    return None;
                }
                if level == 1 {
                    return Some(PhysicalAddress::new(entry.address().as_u64() + (va & 0xFFF)));
                }
                if entry.huge_or_pat() {
                    let page = match level {
                        3 => PAGE_1G,
                        2 => PAGE_2M,
                        _ => return None,
                    };
                    let base = entry.into_bits() & 0x000F_FFFF_FFFF_F000 & !(page - 1);
                    return Some(PhysicalAddress::new(base + (va & (page - 1))));
                }
                table = entry.address();
            }
            None
        }

        /// Map a single page of size `page` (4 KiB, 2 MiB or 1 GiB) by
        /// walking down to `leaf_level` and writing a terminal entry.
        fn map_one(
            &mut self,
            frames: &dyn FrameSource,
            direct_map: &DirectMap,
            va: u64,
            pa: u64,
            map_type: MapType,
            leaf_level: u32,
        ) -> Result<(), MapError> {
            let mut table = self.root;
            let mut level = 4u32;
            while level > leaf_level {
                let idx = index(va, level);
                let entry = read_entry(direct_map, table, idx);
                table = if entry.present() {
                    if entry.huge_or_pat() {
                        // An existing larger mapping blocks the descent.
                        return Err(MapError::MappingNotValid);
                    }
                    entry.address()
                } else {
                    let next = allocate_table(frames, direct_map)?;
                    write_entry(direct_map, table, idx, Entry::table(next, map_type.user));
                    next
                };
                level -= 1;
            }

            let idx = index(va, leaf_level);
            if read_entry(direct_map, table, idx).present() {
                return Err(MapError::AlreadyMapped);
            }
            let huge = leaf_level > 1;
            write_entry(
                direct_map,
                table,
                idx,
                Entry::leaf(PhysicalAddress::new(pa), map_type, huge),
            );
            Ok(())
        }
    }

    impl AddressSpace for PageTable {
        fn map_range(
            &mut self,
            frames: &dyn FrameSource,
            direct_map: &DirectMap,
            virt: VirtualRange,
            phys: PhysicalRange,
            map_type: MapType,
        ) -> Result<(), MapError> {
            debug_assert_eq!(virt.size(), phys.size());
            debug_assert!(virt.address().is_aligned(PAGE_4K));
            debug_assert!(phys.address().is_aligned(PAGE_4K));
            debug_assert!(virt.size() % PAGE_4K == 0);

            let mut offset = 0;
            while offset < virt.size() {
                self.map_one(
                    frames,
                    direct_map,
                    virt.address().as_u64() + offset,
                    phys.address().as_u64() + offset,
                    map_type,
                    1,
                )?;
                offset += PAGE_4K;
            }
            Ok(())
        }

        fn map_range_all_page_sizes(
            &mut self,
            frames: &dyn FrameSource,
            direct_map: &DirectMap,
            virt: VirtualRange,
            phys: PhysicalRange,
            map_type: MapType,
        ) -> Result<(), MapError> {
            debug_assert_eq!(virt.size(), phys.size());
            debug_assert!(virt.address().is_aligned(PAGE_4K));
            debug_assert!(phys.address().is_aligned(PAGE_4K));
            debug_assert!(virt.size() % PAGE_4K == 0);

            let mut offset = 0;
            while offset < virt.size() {
                let va = virt.address().as_u64() + offset;
                let pa = phys.address().as_u64() + offset;
                let remaining = virt.size() - offset;

                let (page, level) = if va % PAGE_1G == 0 && pa % PAGE_1G == 0 && remaining >= PAGE_1G
                {
                    (PAGE_1G, 3)
                } else if va % PAGE_2M == 0 && pa % PAGE_2M == 0 && remaining >= PAGE_2M {
                    (PAGE_2M, 2)
                } else {
                    (PAGE_4K, 1)
                };

                self.map_one(frames, direct_map, va, pa, map_type, level)?;
                offset += page;
            }
            Ok(())
        }
    }

    /// Table index of `va` at the given level (4 = PML4 .. 1 = PT).
    fn index(va: u64, level: u32) -> usize {
        ((va >> (12 + 9 * (level - 1))) & 0x1FF) as usize
    }

    fn entry_ptr(direct_map: &DirectMap, table: PhysicalAddress, idx: usize) -> *mut u64 {
        debug_assert!(idx < ENTRY_COUNT);
        let base: *mut u64 = direct_map.virtual_from_physical(table).as_ptr();
        unsafe { base.add(idx) }
    }

    fn read_entry(direct_map: &DirectMap, table: PhysicalAddress, idx: usize) -> Entry {
        Entry::from_bits(unsafe { entry_ptr(direct_map, table, idx).read_volatile() })
    }

    fn write_entry(direct_map: &DirectMap, table: PhysicalAddress, idx: usize, entry: Entry) {
        unsafe { entry_ptr(direct_map, table, idx).write_volatile(entry.into_bits()) }
    }

    fn allocate_table(
        frames: &dyn FrameSource,
        direct_map: &DirectMap,
    ) -> Result<PhysicalAddress, MapError> {
        let frame = frames
            .allocate_frame()
            .ok_or(MapError::PhysicalMemoryExhausted)?;
        let ptr: *mut u8 = direct_map.virtual_from_physical(frame).as_ptr();
        unsafe { core::ptr::write_bytes(ptr, 0, STANDARD_PAGE_SIZE) };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_addresses::{VirtualAddress, VirtualRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backing store that hands out real (identity-mapped) heap frames.
    struct TestFrames {
        base: *mut u8,
        pages: usize,
        next: AtomicUsize,
    }

    unsafe impl Sync for TestFrames {}

    impl TestFrames {
        fn new(pages: usize) -> Self {
            #[repr(align(4096))]
            struct Frame([u8; 4096]);
            let frames: Vec<Frame> = (0..pages).map(|_| Frame([0; 4096])).collect();
            let base = Box::leak(frames.into_boxed_slice()).as_mut_ptr().cast();
            Self {
                base,
                pages,
                next: AtomicUsize::new(0),
            }
        }
    }

    impl FrameSource for TestFrames {
        fn allocate_frame(&self) -> Option<PhysicalAddress> {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            if n >= self.pages {
                return None;
            }
            Some(PhysicalAddress::from_ptr(unsafe { self.base.add(n * 4096) }))
        }

        fn deallocate_frame(&self, _frame: PhysicalAddress) {}
    }

    #[test]
    fn map_then_translate_4k() {
        let frames = TestFrames::new(16);
        let dm = DirectMap::identity();
        let mut pt = PageTable::new(&frames, &dm).unwrap();

        let target = frames.allocate_frame().unwrap();
        let va = VirtualAddress::new(0xFFFF_9000_0000_3000);
        pt.map_range(
            &frames,
            &dm,
            VirtualRange::new(va, 4096),
            PhysicalRange::new(target, 4096),
            MapType::kernel_data(),
        )
        .unwrap();

        assert_eq!(pt.translate(&dm, va), Some(target));
        assert_eq!(pt.translate(&dm, va + 0x42), Some(target + 0x42));
        assert_eq!(pt.translate(&dm, VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn double_map_is_rejected() {
        let frames = TestFrames::new(16);
        let dm = DirectMap::identity();
        let mut pt = PageTable::new(&frames, &dm).unwrap();

        let target = frames.allocate_frame().unwrap();
        let va = VirtualAddress::new(0xFFFF_9000_0000_0000);
        let virt = VirtualRange::new(va, 4096);
        let phys = PhysicalRange::new(target, 4096);

        pt.map_range(&frames, &dm, virt, phys, MapType::kernel_data())
            .unwrap();
        assert_eq!(
            pt.map_range(&frames, &dm, virt, phys, MapType::kernel_data()),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn frame_exhaustion_is_reported() {
        let frames = TestFrames::new(2);
        let dm = DirectMap::identity();
        let mut pt = PageTable::new(&frames, &dm).unwrap();

        // Only one frame left; the three intermediate tables cannot all be
        // allocated.
        let target = frames.allocate_frame().unwrap();
        let result = pt.map_range(
            &frames,
            &dm,
            VirtualRange::new(VirtualAddress::new(0xFFFF_9000_0000_0000), 4096),
            PhysicalRange::new(target, 4096),
            MapType::kernel_data(),
        );
        assert_eq!(result, Err(MapError::PhysicalMemoryExhausted));
    }
}
