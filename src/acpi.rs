//! ACPI MCFG table layout.
//!
//! The MCFG table publishes the memory-mapped configuration space (ECAM)
//! base address for each PCI segment group. Both structures are byte-exact
//! per the PCI Firmware Specification 3.2, table 4-2; discovery fails
//! silently if the layout drifts, hence the size assertions.

use core::mem::size_of;

/// "MCFG" in table-signature byte order.
pub const ACPI_MCFG_SIGNATURE: u32 = 0x4746_434D;

/// Standard ACPI description header followed by 8 reserved bytes, as laid
/// out at the front of the MCFG table.
#[repr(C, packed)]
pub struct McfgTable {
    pub signature: u32,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
    pub reserved: u64,
}

/// Configuration space base address allocation record. One per segment
/// group, packed directly after the header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct McfgAllocation {
    /// Base address of the configuration space for this segment group.
    pub base_address: u64,
    /// PCI segment group number.
    pub segment_group: u16,
    /// Starting PCI bus number decoded by this base address.
    pub start_bus: u8,
    /// Ending PCI bus number decoded by this base address.
    pub end_bus: u8,
    pub reserved: u32,
}

const_assert_eq!(size_of::<McfgTable>(), 44);
const_assert_eq!(size_of::<McfgAllocation>(), 16);

/// Reads the first allocation record out of a raw MCFG table buffer.
///
/// Multi-segment systems carry further records, but only the first segment
/// group is consulted here.
pub fn first_allocation(table: &[u8]) -> Option<McfgAllocation> {
    let offset = size_of::<McfgTable>();

    if table.len() < offset + size_of::<McfgAllocation>() {
        return None;
    }

    // The buffer carries no alignment guarantee, so copy out unaligned.
    Some(unsafe { core::ptr::read_unaligned(table[offset..].as_ptr().cast::<McfgAllocation>()) })
}
