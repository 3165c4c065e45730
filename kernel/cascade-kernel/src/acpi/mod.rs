//! ACPI discovery and the interpreter host surface.
//!
//! The kernel embeds a foreign AML interpreter; this module finds and
//! validates the root pointer during stage 1 and exposes the callback
//! table ([`host`]) the interpreter drives the machine through.

pub mod host;

use crate::memory;
use cascade_addresses::PhysicalAddress;
use cascade_sync::SyncOnceCell;
use log::info;

/// Validated ACPI root tables.
#[derive(Copy, Clone, Debug)]
pub struct AcpiRoots {
    pub rsdp: PhysicalAddress,
    pub rsdt: Option<PhysicalAddress>,
    pub xsdt: Option<PhysicalAddress>,
}

static ACPI_ROOTS: SyncOnceCell<AcpiRoots> = SyncOnceCell::new();

/// ACPI 1.0 Root System Description Pointer.
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8], // "RSD PTR "
    checksum: u8,       // first 20 bytes sum to 0
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
}

/// ACPI 2.0+ extension of the RSDP.
#[repr(C, packed)]
struct Xsdp {
    v1: Rsdp,
    length: u32,
    xsdt_addr: u64,
    ext_checksum: u8, // whole structure sums to 0
    reserved: [u8; 3],
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Borrow `len` bytes of physical memory through the uncached direct map.
unsafe fn physical_bytes<'a>(addr: PhysicalAddress, len: usize) -> &'a [u8] {
    let ptr: *const u8 = memory::non_cached_direct_map().virtual_from_physical(addr).as_ptr();
    unsafe { core::slice::from_raw_parts(ptr, len) }
}

/// Validate the RSDP/XSDP and record the root table addresses.
///
/// # Panics
/// A bad signature or checksum means the firmware handoff is corrupt;
/// the kernel treats that as fatal.
pub fn init(rsdp_addr: PhysicalAddress) {
    let v1_bytes = unsafe { physical_bytes(rsdp_addr, size_of::<Rsdp>()) };
    assert_eq!(&v1_bytes[0..8], b"RSD PTR ", "RSDP signature mismatch");
    assert_eq!(byte_sum(&v1_bytes[0..20]), 0, "RSDP checksum mismatch");

    let v1 = unsafe { &*v1_bytes.as_ptr().cast::<Rsdp>() };
    let revision = v1.revision;
    let rsdt = match v1.rsdt_addr {
        0 => None,
        addr => Some(PhysicalAddress::new(u64::from(addr))),
    };

    let xsdt = if revision >= 2 {
        let v2_bytes = unsafe { physical_bytes(rsdp_addr, size_of::<Xsdp>()) };
        let v2 = unsafe { &*v2_bytes.as_ptr().cast::<Xsdp>() };
        let full = unsafe { physical_bytes(rsdp_addr, v2.length as usize) };
        assert_eq!(byte_sum(full), 0, "XSDP extended checksum mismatch");
        Some(PhysicalAddress::new(v2.xsdt_addr))
    } else {
        None
    };

    let roots = AcpiRoots {
        rsdp: rsdp_addr,
        rsdt,
        xsdt,
    };
    ACPI_ROOTS.set(roots).expect("ACPI roots set twice");

    info!(
        "ACPI revision {revision}: rsdt={rsdt:?} xsdt={xsdt:?}",
    );

    host::init();

    match find_table(&roots, b"MCFG") {
        Some(mcfg) => configure_pci_ecam(mcfg),
        None => info!("no MCFG table; PCI configuration space is unavailable"),
    }
}

/// The validated roots; available once [`init`] has run.
pub fn roots() -> Option<&'static AcpiRoots> {
    ACPI_ROOTS.get()
}

/// Common header of every system description table.
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// Locate a table by signature via the XSDT (preferred) or RSDT.
///
/// The matching table is checksum-validated before its address is
/// returned; a corrupt table is fatal, same as a corrupt RSDP.
fn find_table(roots: &AcpiRoots, signature: &[u8; 4]) -> Option<PhysicalAddress> {
    let (root, wide) = match (roots.xsdt, roots.rsdt) {
        (Some(xsdt), _) => (xsdt, true),
        (None, Some(rsdt)) => (rsdt, false),
        (None, None) => return None,
    };

    let header = unsafe { physical_bytes(root, size_of::<SdtHeader>()) };
    let total_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    let entry_size = if wide { 8 } else { 4 };
    let entry_bytes =
        unsafe { physical_bytes(root, total_len) }.get(size_of::<SdtHeader>()..)?;

    for entry in entry_bytes.chunks_exact(entry_size) {
        let addr = if wide {
            u64::from_le_bytes(entry.try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(entry.try_into().unwrap()))
        };
        let addr = PhysicalAddress::new(addr);
        let candidate = unsafe { physical_bytes(addr, size_of::<SdtHeader>()) };
        if &candidate[0..4] != signature {
            continue;
        }
        let len = u32::from_le_bytes(candidate[4..8].try_into().unwrap()) as usize;
        let full = unsafe { physical_bytes(addr, len) };
        assert_eq!(byte_sum(full), 0, "ACPI table checksum mismatch");
        return Some(addr);
    }
    None
}

/// Record the first MCFG allocation as the PCI ECAM window.
fn configure_pci_ecam(mcfg: PhysicalAddress) {
    // MCFG: SDT header, 8 reserved bytes, then 16-byte allocations of
    // { base: u64, segment: u16, start_bus: u8, end_bus: u8, _: u32 }.
    const ALLOCATIONS_OFFSET: usize = size_of::<SdtHeader>() + 8;

    let header = unsafe { physical_bytes(mcfg, size_of::<SdtHeader>()) };
    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if len < ALLOCATIONS_OFFSET + 16 {
        info!("MCFG carries no allocations; PCI configuration space is unavailable");
        return;
    }

    let body = unsafe { physical_bytes(mcfg, len) };
    let entry = &body[ALLOCATIONS_OFFSET..ALLOCATIONS_OFFSET + 16];
    let base = u64::from_le_bytes(entry[0..8].try_into().unwrap());
    let segment = u16::from_le_bytes(entry[8..10].try_into().unwrap());
    host::set_pci_ecam_base(PhysicalAddress::new(base));
    info!("PCI ECAM segment {segment} at {:#x}", base);
}
