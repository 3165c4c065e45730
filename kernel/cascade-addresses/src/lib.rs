//! # Physical and virtual address types
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at
//! compile time, plus the byte-range and direct-map types the memory
//! subsystems are built on.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | An address in host RAM or MMIO space. |
//! | [`VirtualAddress`] | A page-table translated address. |
//! | [`PhysicalRange`] / [`VirtualRange`] | A non-empty `[address, address + size)` byte range. |
//! | [`DirectMap`] | The bootloader-provided window mapping all of physical memory at a fixed virtual offset. |
//!
//! All arithmetic helpers are `const fn` and free of hidden cost in release
//! builds.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Align `value` down to `align`, which must be a power of two.
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align `value` up to `align`, which must be a power of two.
///
/// Wraps to `0` if the aligned value does not fit in a `u64`; use
/// [`checked_align_up`] where that matters.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value.wrapping_add(align - 1) & !(align - 1)
}

/// Align `value` up to `align`, returning `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Is `value` a multiple of `align` (a power of two)?
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

macro_rules! address_type {
    ($(#[$doc:meta])* $name:ident, $fmt_tag:literal) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn from_ptr<T>(ptr: *const T) -> Self {
                union PtrAsU64<T> {
                    ptr: *const T,
                    addr: u64,
                }
                Self(unsafe { PtrAsU64 { ptr }.addr })
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            /// Round down to the previous multiple of `align` (power of two).
            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u64) -> Self {
                Self(align_down(self.0, align))
            }

            /// Round up to the next multiple of `align` (power of two).
            #[inline]
            #[must_use]
            pub const fn align_up(self, align: u64) -> Self {
                Self(align_up(self.0, align))
            }

            /// Is this address a multiple of `align` (power of two)?
            #[inline]
            #[must_use]
            pub const fn is_aligned(self, align: u64) -> bool {
                is_aligned(self.0, align)
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($fmt_tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    /// Physical memory address (host RAM / MMIO).
    ///
    /// Carries intent only; it does not assert that the address is backed by
    /// anything. Use [`DirectMap`] to obtain a dereferenceable pointer.
    PhysicalAddress,
    "PA"
);

address_type!(
    /// Virtual memory address.
    ///
    /// Canonicality is not validated at runtime; the type only prevents
    /// accidental VA/PA mix-ups.
    VirtualAddress,
    "VA"
);

impl VirtualAddress {
    /// Reinterpret as a raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

macro_rules! range_type {
    ($(#[$doc:meta])* $name:ident, $addr:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq)]
        pub struct $name {
            address: $addr,
            size: u64,
        }

        impl $name {
            /// Construct a range; `size` must be non-zero.
            #[inline]
            #[must_use]
            pub const fn new(address: $addr, size: u64) -> Self {
                debug_assert!(size > 0, "ranges are non-empty");
                Self { address, size }
            }

            #[inline]
            #[must_use]
            pub const fn address(self) -> $addr {
                self.address
            }

            #[inline]
            #[must_use]
            pub const fn size(self) -> u64 {
                self.size
            }

            /// First address past the range.
            #[inline]
            #[must_use]
            pub const fn end(self) -> $addr {
                $addr::new(self.address.as_u64() + self.size)
            }

            #[inline]
            #[must_use]
            pub const fn contains(self, addr: $addr) -> bool {
                addr.as_u64() >= self.address.as_u64()
                    && addr.as_u64() < self.address.as_u64() + self.size
            }

            #[inline]
            #[must_use]
            pub const fn overlaps(self, other: Self) -> bool {
                self.address.as_u64() < other.end().as_u64()
                    && other.address.as_u64() < self.end().as_u64()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "(0x{:X}..0x{:X})"),
                    self.address.as_u64(),
                    self.address.as_u64() + self.size
                )
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "[{} .. {})",
                    self.address,
                    $addr::new(self.address.as_u64() + self.size)
                )
            }
        }
    };
}

range_type!(
    /// A non-empty physical byte range `[address, address + size)`.
    PhysicalRange,
    PhysicalAddress
);

range_type!(
    /// A non-empty virtual byte range `[address, address + size)`.
    VirtualRange,
    VirtualAddress
);

/// The bootloader-provided direct map of physical memory.
///
/// For every physical address `p` of system RAM, `p + base` is a mapped,
/// pointer-reachable virtual address. A second instance with identical
/// layout but uncached memory type covers MMIO.
///
/// ### Invariants
/// - Translation is a pure offset; no page-table walk is performed.
/// - Callers must only translate addresses that lie within the mapped
///   window; this is checked in debug builds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DirectMap {
    base: VirtualAddress,
    size: u64,
}

impl DirectMap {
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// A zero-offset map covering the full address space.
    ///
    /// Used by hosted tests, where "physical" addresses already are valid
    /// pointers.
    #[inline]
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            base: VirtualAddress::zero(),
            size: u64::MAX,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        self.size
    }

    /// Translate a physical address into the direct-map window.
    #[inline]
    #[must_use]
    pub const fn virtual_from_physical(self, addr: PhysicalAddress) -> VirtualAddress {
        debug_assert!(addr.as_u64() <= self.size, "address beyond the direct map");
        VirtualAddress::new(self.base.as_u64().wrapping_add(addr.as_u64()))
    }

    /// Translate a direct-map virtual address back to its physical address.
    #[inline]
    #[must_use]
    pub const fn physical_from_virtual(self, addr: VirtualAddress) -> PhysicalAddress {
        debug_assert!(
            addr.as_u64().wrapping_sub(self.base.as_u64()) <= self.size,
            "address outside the direct map"
        );
        PhysicalAddress::new(addr.as_u64().wrapping_sub(self.base.as_u64()))
    }

    /// Translate a whole physical range.
    #[inline]
    #[must_use]
    pub const fn virtual_range(self, range: PhysicalRange) -> VirtualRange {
        VirtualRange::new(self.virtual_from_physical(range.address()), range.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
        assert_eq!(align_up(0x12345, 0x1000), 0x13000);
        assert_eq!(align_up(0x12000, 0x1000), 0x12000);
        assert!(is_aligned(0x12000, 0x1000));
        assert!(!is_aligned(0x12008, 0x1000));
        assert_eq!(checked_align_up(u64::MAX - 2, 0x1000), None);
    }

    #[test]
    fn address_arithmetic() {
        let pa = PhysicalAddress::new(0x1234);
        assert_eq!((pa + 0x10).as_u64(), 0x1244);
        assert_eq!(pa.align_down(0x1000).as_u64(), 0x1000);
        assert_eq!(pa.align_up(0x1000).as_u64(), 0x2000);
        assert_eq!(PhysicalAddress::new(0x2000) - pa, 0x2000 - 0x1234);
    }

    #[test]
    fn range_queries() {
        let r = PhysicalRange::new(PhysicalAddress::new(0x1000), 0x1000);
        assert_eq!(r.end().as_u64(), 0x2000);
        assert!(r.contains(PhysicalAddress::new(0x1fff)));
        assert!(!r.contains(PhysicalAddress::new(0x2000)));

        let s = PhysicalRange::new(PhysicalAddress::new(0x1800), 0x1000);
        assert!(r.overlaps(s));
        let t = PhysicalRange::new(PhysicalAddress::new(0x2000), 0x1000);
        assert!(!r.overlaps(t));
    }

    #[test]
    fn direct_map_round_trip() {
        let dm = DirectMap::new(VirtualAddress::new(0xFFFF_8880_0000_0000), 1 << 40);
        let pa = PhysicalAddress::new(0x10_2000);
        let va = dm.virtual_from_physical(pa);
        assert_eq!(va.as_u64(), 0xFFFF_8880_0010_2000);
        assert_eq!(dm.physical_from_virtual(va), pa);

        let id = DirectMap::identity();
        assert_eq!(
            id.virtual_from_physical(PhysicalAddress::new(0x42)).as_u64(),
            0x42
        );
    }
}
