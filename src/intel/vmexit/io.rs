//! I/O instruction vm-exit handling.
//!
//! While transparent mode is active this handler emulates the legacy PCI
//! Configuration Access Mechanism: writes to the address latch at `0xCF8`
//! are recorded per-vCPU and forwarded, reads of the data window at
//! `0xCFC..=0xCFF` are decoded and served from real configuration space
//! with identity dwords of VMware functions substituted, and the VMware
//! backdoor ports answer all-ones. Every access it does not claim is
//! executed against real hardware with the guest-visible semantics intact,
//! including string/REP forms.
//!
//! The pass-through shape follows Petr Benes's hvpp
//! (hvpp/vmexit/vmexit_passthrough.cpp).

use crate::intel::registers::GuestRegisters;
use crate::intel::vcpu::Vcpu;
use crate::pci::{
    PciConfigAddress, PCI_CONFIG_ADDRESS_PORT, PCI_CONFIG_DATA_PORT, PCI_CONFIG_DATA_PORT_END,
};
use crate::platform::{PciConfigSpace, PortIo};
use crate::transparency::{spoof, TransparencyState};
use bit_field::BitField;
use core::mem::size_of;
use x86::bits64::rflags::RFlags;

/// Guest I/O backdoor ports of VMware tooling. Trapping these without
/// masking them crashes VMware Tools in a nested setup, so they are always
/// claimed while transparent mode is on.
const VMWARE_BACKDOOR_PORT: u16 = 0x5658;
const VMWARE_BACKDOOR_HB_PORT: u16 = 0x5659;

/// Exit qualification for I/O instructions.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's
/// Manual, Table 28-5. Exit Qualification for I/O Instructions: bits 2:0
/// size of access minus one, bit 3 direction (1 = IN), bit 4 string
/// instruction, bit 5 REP prefixed, bits 31:16 port number.
#[derive(Debug, Clone, Copy)]
pub struct IoExitQualification(u64);

impl IoExitQualification {
    pub fn new(qualification: u64) -> Self {
        Self(qualification)
    }

    /// Number of bytes moved per element: 1, 2 or 4.
    pub fn size_of_access(self) -> u32 {
        self.0.get_bits(0..3) as u32 + 1
    }

    pub fn direction(self) -> IoDirection {
        if self.0.get_bit(3) {
            IoDirection::In
        } else {
            IoDirection::Out
        }
    }

    pub fn is_string(self) -> bool {
        self.0.get_bit(4)
    }

    pub fn is_rep(self) -> bool {
        self.0.get_bit(5)
    }

    pub fn port(self) -> u16 {
        self.0.get_bits(16..32) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Out,
    In,
}

/// Handles an I/O instruction vm-exit.
///
/// CPL is not checked here; a guest access that should fault raises #GP
/// before a vm-exit can occur (Intel SDM Vol3C, 26.1.1 Relative Priority
/// of Faults and VM Exits).
pub fn handle_io<P>(
    state: &TransparencyState,
    vcpu: &mut Vcpu,
    registers: &mut GuestRegisters,
    qualification: IoExitQualification,
    flags: RFlags,
    platform: &mut P,
) where
    P: PortIo + PciConfigSpace,
{
    // Resolve the source or destination. String forms always work through
    // RDI (in) or RSI (out); everything else reads or writes the low bytes
    // of RAX in place, at the access width, so the rest of the register
    // survives exactly as it does on real hardware.
    let pointer: *mut u8 = if qualification.is_string() {
        match qualification.direction() {
            IoDirection::In => registers.rdi as *mut u8,
            IoDirection::Out => registers.rsi as *mut u8,
        }
    } else {
        (&mut registers.rax as *mut u64).cast()
    };

    let port = qualification.port();
    let size = qualification.size_of_access();

    // REP prefixed instructions take their count from the low half of RCX.
    let count = if qualification.is_rep() {
        (registers.rcx & 0xFFFF_FFFF) as u32
    } else {
        1
    };

    let mut handled = false;

    if state.is_enabled() {
        handled = claim_transparent_access(state, vcpu, registers, qualification, pointer, platform);
    }

    if !handled {
        passthrough(qualification, port, size, count, pointer, platform);
    }

    if qualification.is_string() {
        // Advance the index register by everything that was moved: down
        // when the guest's direction flag is set, up otherwise.
        let advance = count as u64 * size as u64;
        let index = match qualification.direction() {
            IoDirection::In => &mut registers.rdi,
            IoDirection::Out => &mut registers.rsi,
        };

        if flags.contains(RFlags::FLAGS_DF) {
            *index = index.wrapping_sub(advance);
        } else {
            *index = index.wrapping_add(advance);
        }

        // The whole repetition completed within one exit as far as the
        // guest can tell.
        if qualification.is_rep() {
            registers.rcx = 0;
        }
    }
}

/// Claims the access if it is one of the PCI CAM or backdoor patterns the
/// transparency layer emulates. Returns whether it was claimed.
fn claim_transparent_access<P>(
    state: &TransparencyState,
    vcpu: &mut Vcpu,
    registers: &mut GuestRegisters,
    qualification: IoExitQualification,
    pointer: *mut u8,
    platform: &mut P,
) -> bool
where
    P: PortIo + PciConfigSpace,
{
    let port = qualification.port();
    let size = qualification.size_of_access();
    let direction = qualification.direction();
    let string = qualification.is_string();

    if port == PCI_CONFIG_ADDRESS_PORT && direction == IoDirection::Out && !string && size == 4 {
        // Latch the address for the INs that follow, and forward the write
        // so the platform's own latch agrees with ours.
        vcpu.last_pci_config_address = registers.rax as u32;
        platform.outl(port, vcpu.last_pci_config_address);
        return true;
    }

    if (PCI_CONFIG_DATA_PORT..=PCI_CONFIG_DATA_PORT_END).contains(&port)
        && direction == IoDirection::In
        && !string
    {
        let address = PciConfigAddress::new(vcpu.last_pci_config_address);

        // Without a valid enabled latch this is not a configuration read;
        // let it fall through to hardware.
        if address.raw() == 0 || !address.enabled() {
            return false;
        }

        let register = address.register_offset();
        let byte_offset = (port - PCI_CONFIG_DATA_PORT) as u32;

        let original = platform.read_cam(
            address.bus(),
            address.device(),
            address.function(),
            register,
            size_of::<u32>(),
        ) as u32;

        let mut effective = original;

        if spoof::is_identity_offset(register) {
            if let Some(device_id) = spoof::spoof_target_device(platform, address) {
                effective = spoof::fake_id(state.rand(), device_id);
                log::trace!(
                    "Substituting identity dword {:#010x} for device {:#06x}",
                    effective,
                    device_id
                );
            }
        }

        // Slice the requested bytes out of the effective dword. The word
        // read straddling the window end and the unaligned dword reads
        // reproduce the data-latch behavior guests observe on hardware.
        unsafe {
            match size {
                1 => *pointer = ((effective >> (byte_offset * 8)) & 0xFF) as u8,
                2 => {
                    let value = if byte_offset <= 2 {
                        (effective >> (byte_offset * 8)) & 0xFFFF
                    } else {
                        (effective >> 24) & 0xFF
                    };
                    *pointer.cast::<u16>() = value as u16;
                }
                4 => {
                    let value = if byte_offset == 0 {
                        effective
                    } else {
                        effective >> (byte_offset * 8)
                    };
                    *pointer.cast::<u32>() = value;
                }
                _ => {}
            }
        }

        return true;
    }

    if port == VMWARE_BACKDOOR_PORT || port == VMWARE_BACKDOOR_HB_PORT {
        // Masked rather than mimicked: all-ones is what an empty port
        // returns, and nothing reaches real hardware either way.
        if !string && direction == IoDirection::In {
            unsafe {
                match size {
                    1 => *pointer = 0xFF,
                    2 => *pointer.cast::<u16>() = 0xFFFF,
                    4 => *pointer.cast::<u32>() = 0xFFFF_FFFF,
                    _ => {}
                }
            }
        }
        return true;
    }

    false
}

/// Executes an unclaimed access against real hardware, preserving
/// direction, size, and REP count.
fn passthrough<P: PortIo>(
    qualification: IoExitQualification,
    port: u16,
    size: u32,
    count: u32,
    pointer: *mut u8,
    platform: &mut P,
) {
    match qualification.direction() {
        IoDirection::In => {
            if qualification.is_string() {
                unsafe {
                    match size {
                        1 => platform.insb(port, pointer, count),
                        2 => platform.insw(port, pointer.cast(), count),
                        4 => platform.insl(port, pointer.cast(), count),
                        _ => {}
                    }
                }
            } else {
                // The pointer aims at the guest RAX slot, so these stores
                // update RAX directly.
                unsafe {
                    match size {
                        1 => *pointer = platform.inb(port),
                        2 => *pointer.cast::<u16>() = platform.inw(port),
                        4 => *pointer.cast::<u32>() = platform.inl(port),
                        _ => {}
                    }
                }
            }
        }
        IoDirection::Out => {
            if qualification.is_string() {
                unsafe {
                    match size {
                        1 => platform.outsb(port, pointer, count),
                        2 => platform.outsw(port, pointer.cast(), count),
                        4 => platform.outsl(port, pointer.cast(), count),
                        _ => {}
                    }
                }
            } else {
                unsafe {
                    match size {
                        1 => platform.outb(port, *pointer),
                        2 => platform.outw(port, *pointer.cast::<u16>()),
                        4 => platform.outl(port, *pointer.cast::<u32>()),
                        _ => {}
                    }
                }
            }
        }
    }
}
