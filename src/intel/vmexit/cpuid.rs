//! `CPUID` vm-exit handling: scrub the leaves a guest can use to detect
//! that it runs under a hypervisor.

use crate::intel::registers::GuestRegisters;
use crate::transparency::TransparencyState;
use bitfield::BitMut;
use x86::cpuid::{cpuid, CpuIdResult};

/// CPUID leaves whose results betray a hypervisor.
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual,
/// CPUID—CPU Identification; leaves 40000000H+ are reserved for hypervisor use.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CpuidLeaf {
    /// Processor and processor feature identifiers.
    FeatureInformation = 0x1,
    /// Hypervisor vendor string and maximum hypervisor leaf.
    HypervisorVendor = 0x4000_0000,
    /// Hypervisor interface identification ("Hv#1" under Hyper-V).
    HypervisorInterface = 0x4000_0001,
}

/// Bit 31 of ECX for CPUID with EAX=1, reserved by both Intel and AMD to
/// indicate a hypervisor is present.
const HYPERVISOR_PRESENT_BIT: usize = 31;

/// Scrubs hypervisor fingerprints from one `CPUID` result.
///
/// The feature-information leaf keeps every bit except the
/// hypervisor-present indication; the two hypervisor discovery leaves are
/// zeroed outright so the 40000000H+ range carries no usable data. Any
/// other leaf passes through untouched.
pub fn transparent_cpuid(leaf: u64, cpu_info: &mut CpuIdResult) {
    if leaf == CpuidLeaf::FeatureInformation as u64 {
        cpu_info.ecx.set_bit(HYPERVISOR_PRESENT_BIT, false);
    } else if leaf == CpuidLeaf::HypervisorVendor as u64
        || leaf == CpuidLeaf::HypervisorInterface as u64
    {
        cpu_info.eax = 0;
        cpu_info.ebx = 0;
        cpu_info.ecx = 0;
        cpu_info.edx = 0;
    }
}

/// Handles the `CPUID` vm-exit: executes the instruction on the host for
/// the guest's (leaf, sub-leaf), filters the result while transparent mode
/// is active, and writes it back to the guest registers.
pub fn handle_cpuid(state: &TransparencyState, registers: &mut GuestRegisters) {
    let leaf = registers.rax as u32;
    let sub_leaf = registers.rcx as u32;

    let mut cpuid_result = cpuid!(leaf, sub_leaf);

    if state.is_enabled() {
        transparent_cpuid(registers.rax, &mut cpuid_result);
    }

    registers.rax = cpuid_result.eax as u64;
    registers.rbx = cpuid_result.ebx as u64;
    registers.rcx = cpuid_result.ecx as u64;
    registers.rdx = cpuid_result.edx as u64;
}
