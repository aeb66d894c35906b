//! Device identity substitution for VMware virtual hardware.
//!
//! Every VMware function carries vendor id `0x15AD`, and its device ids
//! are well known to detection tooling. Each table entry maps one such
//! device to a handful of vendor:device dwords that a comparable real or
//! commonly-emulated device would report. Which candidate is presented is
//! fixed for the whole session so that repeated probes agree with each
//! other; an identity that changes between reads is itself a giveaway.

use crate::pci::PciConfigAddress;
use crate::platform::PciConfigSpace;
use core::mem::size_of;

/// PCI vendor id assigned to VMware.
pub const VMWARE_PCI_VENDOR_ID: u16 = 0x15AD;

const MAX_REPLACEMENTS: usize = 4;

/// One spoofable device: the VMware device id and the candidate
/// vendor:device dwords that may stand in for it.
struct SpoofingEntry {
    device_id: u16,
    replacements: [u32; MAX_REPLACEMENTS],
    count: u8,
}

static SPOOFING_DICTIONARY: [SpoofingEntry; 18] = [
    // SVGA II adapter: VirtIO GPU, Cirrus Logic CLGD 5446, Bochs VBE
    SpoofingEntry {
        device_id: 0x0405,
        replacements: [0x1AF41050, 0x101300B8, 0x12341111, 0],
        count: 3,
    },
    // SVGA II adapter (Fusion): VirtIO GPU, Cirrus Logic CLGD 5446
    SpoofingEntry {
        device_id: 0x0406,
        replacements: [0x1AF41050, 0x101300B8, 0, 0],
        count: 2,
    },
    // SVGA adapter: VirtIO GPU, Bochs VBE, Cirrus Logic CLGD 5446
    SpoofingEntry {
        device_id: 0x0710,
        replacements: [0x1AF41050, 0x12341111, 0x101300B8, 0],
        count: 3,
    },
    // VMXNET ethernet: Intel E1000, AMD PCnet, VirtIO NET, Realtek RTL8139
    SpoofingEntry {
        device_id: 0x0720,
        replacements: [0x8086100E, 0x10222000, 0x1AF41000, 0x10EC8139],
        count: 4,
    },
    // VMCI: VirtIO Console, VirtIO Vsock
    SpoofingEntry {
        device_id: 0x0740,
        replacements: [0x1AF41003, 0x1AF41045, 0, 0],
        count: 2,
    },
    // USB2 EHCI controller: Intel ICH9 EHCI, QEMU EHCI, VIA EHCI
    SpoofingEntry {
        device_id: 0x0770,
        replacements: [0x8086293A, 0x1B36000D, 0x11063104, 0],
        count: 3,
    },
    // USB1.1 UHCI controller: Intel PIIX4 UHCI, Intel ICH9 UHCI, VIA UHCI
    SpoofingEntry {
        device_id: 0x0774,
        replacements: [0x80867112, 0x80862934, 0x11063038, 0],
        count: 3,
    },
    // USB3 xHCI 0.96: Intel Panther Point xHCI, QEMU xHCI, Fresco Logic FL1100
    SpoofingEntry {
        device_id: 0x0778,
        replacements: [0x80861E31, 0x1B36000E, 0x1B731100, 0],
        count: 3,
    },
    // USB3 xHCI 1.0: Intel Lynx Point xHCI, ASMedia ASM1042, Renesas uPD720202
    SpoofingEntry {
        device_id: 0x0779,
        replacements: [0x80868C31, 0x1B211142, 0x19120015, 0],
        count: 3,
    },
    // PCI bridge: Intel 82801, QEMU i440FX PCI-PCI, Intel 6300ESB PCI-PCI
    SpoofingEntry {
        device_id: 0x0790,
        replacements: [0x8086244E, 0x8086123B, 0x80862640, 0],
        count: 3,
    },
    // PCI Express root port: Intel Q35, Intel ICH10, AMD Starship
    SpoofingEntry {
        device_id: 0x07A0,
        replacements: [0x808629A0, 0x80863A40, 0x10221483, 0],
        count: 3,
    },
    // VMXNET3 ethernet: VirtIO NET (modern), Intel 82574L, Intel 82576
    SpoofingEntry {
        device_id: 0x07B0,
        replacements: [0x1AF41041, 0x808610D3, 0x808610E6, 0],
        count: 3,
    },
    // PVSCSI controller: VirtIO SCSI, LSI SAS1068E, LSI MegaRAID SAS 2008
    SpoofingEntry {
        device_id: 0x07C0,
        replacements: [0x1AF41004, 0x10000058, 0x1000007, 0],
        count: 3,
    },
    // SATA AHCI controller: Intel ICH9 AHCI, VirtIO Block, Marvell 88SE9230
    SpoofingEntry {
        device_id: 0x07E0,
        replacements: [0x80862922, 0x1AF41001, 0x1B4B9230, 0],
        count: 3,
    },
    // NVMe SSD controller: Intel Optane, Intel client NVMe, VirtIO Block
    SpoofingEntry {
        device_id: 0x07F0,
        replacements: [0x80865845, 0x8086F1A6, 0x1AF41001, 0],
        count: 3,
    },
    // Hypervisor ROM interface: VirtIO Memballoon, VirtIO RNG, IVSHMEM
    SpoofingEntry {
        device_id: 0x0801,
        replacements: [0x1AF41002, 0x1AF41005, 0x1AF41110, 0],
        count: 3,
    },
    // Paravirtual RDMA: Mellanox ConnectX-3, Mellanox ConnectX-4 Lx
    SpoofingEntry {
        device_id: 0x0820,
        replacements: [0x15B31003, 0x15B31015, 0, 0],
        count: 2,
    },
    // HD Audio: Intel ICH6 HD Audio, Intel ICH9 HD Audio, VirtIO Sound, Intel AC'97
    SpoofingEntry {
        device_id: 0x1977,
        replacements: [0x80862668, 0x8086293E, 0x1AF41052, 0x808624D5],
        count: 4,
    },
];

/// Table slot whose first candidate doubles as the answer for device ids
/// we have no entry for (the generic PCI bridge identity).
const FALLBACK_INDEX: usize = 9;

/// Configuration dwords that can betray the real identity: vendor/device
/// id at 0x00, subsystem ids at 0x2C, and the first vendor-specific
/// capability dword at 0x44.
pub fn is_identity_offset(offset: u8) -> bool {
    matches!(offset, 0x00 | 0x2C | 0x44)
}

/// Checks whether the function addressed by the CAM latch is VMware
/// silicon that must not show through, returning its real device id.
pub fn spoof_target_device<P: PciConfigSpace>(
    platform: &mut P,
    address: PciConfigAddress,
) -> Option<u16> {
    let id = platform.read_cam(
        address.bus(),
        address.device(),
        address.function(),
        0x00,
        size_of::<u32>(),
    ) as u32;

    let vendor_id = (id & 0xFFFF) as u16;
    let device_id = (id >> 16) as u16;

    (vendor_id == VMWARE_PCI_VENDOR_ID && device_id != 0).then_some(device_id)
}

/// Picks the substitute vendor:device dword for a real device id.
///
/// The selection index comes from the session seed, so the same device
/// answers every probe with the same identity until the hypervisor
/// unloads. Unknown device ids fall back to the first candidate of the
/// PCI bridge entry.
pub fn fake_id(rand: u32, device_id: u16) -> u32 {
    for entry in SPOOFING_DICTIONARY.iter() {
        if entry.device_id == device_id && entry.count > 0 {
            return entry.replacements[rand as usize % entry.count as usize];
        }
    }

    SPOOFING_DICTIONARY[FALLBACK_INDEX].replacements[0]
}
