//! Transparent-mode state and its enable/disable control path.
//!
//! Transparent mode hides the debugger from anti-debugging and
//! anti-hypervisor probes. Enabling it discovers the PCIe ECAM region from
//! firmware, hooks the memory-mapped identity pages of VMware functions,
//! derives the session spoofing seed, and forces vm-exits on the PCI CAM
//! ports on every core. The per-access spoofing itself lives in
//! [`crate::intel::vmexit::io`].

pub mod spoof;

use crate::acpi::{self, ACPI_MCFG_SIGNATURE};
use crate::error::HypervisorError;
use crate::pci::{
    ecam_function_base, DEVICE_MAX_NUM, FUNCTION_MAX_NUM, PCI_CONFIG_ADDRESS_PORT,
};
use crate::platform::{CoreBroadcast, EptHooks, FirmwareTables, PciConfigSpace, SystemClock};
use crate::transparency::spoof::VMWARE_PCI_VENDOR_ID;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Identity presented through hooked ECAM pages: an Intel 82801 PCI
/// bridge, boring enough that nothing looks twice at it.
const ECAM_SPOOF_VENDOR_ID: u16 = 0x8086;
const ECAM_SPOOF_DEVICE_ID: u16 = 0x244E;

/// Process-wide transparent-mode state, shared by every core.
///
/// Only the administrative enable/disable path mutates this, and the
/// command channel serializes those calls, so plain atomic loads are
/// enough on the vm-exit paths.
pub struct TransparencyState {
    /// Whether transparent mode is active.
    enabled: AtomicBool,

    /// Session spoofing seed. Derived once from the system clock the first
    /// time transparent mode is enabled and never re-derived, so the
    /// spoofed identities stay stable for the whole session.
    rand: AtomicU32,

    /// Base physical address of the PCIe ECAM region, when discovered.
    ecam_base: AtomicU64,

    /// Size in bytes of the ECAM region, when discovered.
    ecam_size: AtomicU64,
}

/// The single process-wide instance, zero/disabled at hypervisor load.
pub static TRANSPARENCY: TransparencyState = TransparencyState::new();

impl TransparencyState {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            rand: AtomicU32::new(0),
            ecam_base: AtomicU64::new(0),
            ecam_size: AtomicU64::new(0),
        }
    }

    /// Whether transparent mode is currently active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The session spoofing seed.
    pub fn rand(&self) -> u32 {
        self.rand.load(Ordering::Relaxed)
    }

    /// Discovered ECAM region as (base, size), zeros when discovery was
    /// skipped or failed.
    pub fn ecam_region(&self) -> (u64, u64) {
        (
            self.ecam_base.load(Ordering::Relaxed),
            self.ecam_size.load(Ordering::Relaxed),
        )
    }

    /// Activates transparent mode (hides the debugger).
    ///
    /// ECAM discovery is best-effort: a missing or unreadable MCFG table
    /// only skips the memory-mapped hooks, it does not fail the enable.
    /// The final step forces vm-exits on the five PCI CAM ports on every
    /// logical processor, which is what routes guest configuration probes
    /// into the emulator.
    pub fn hide_debugger<P>(&self, platform: &mut P) -> Result<(), HypervisorError>
    where
        P: FirmwareTables + PciConfigSpace + EptHooks + CoreBroadcast + SystemClock,
    {
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HypervisorError::TransparentModeAlreadyEnabled);
        }

        self.discover_ecam(platform);

        // One seed per session. The admin path is serialized, so the
        // zero-check cannot race with another writer.
        if self.rand.load(Ordering::Relaxed) == 0 {
            let time = platform.precise_time();
            let folded = (time as u32) ^ ((time >> 32) as u32);
            self.rand.store(lehmer_step(folded), Ordering::Relaxed);
        }

        for port in [0xCFCu16, 0xCFD, 0xCFE, 0xCFF, PCI_CONFIG_ADDRESS_PORT] {
            platform.io_bitmap_change_all_cores(port as u32);
        }

        Ok(())
    }

    /// Deactivates transparent mode (unhides the debugger).
    ///
    /// The CAM ports keep causing vm-exits; the emulator just stops
    /// claiming them, so every access reverts to pass-through.
    pub fn unhide_debugger(&self) -> Result<(), HypervisorError> {
        if self
            .enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HypervisorError::TransparentModeAlreadyDisabled);
        }

        Ok(())
    }

    /// Locates the ECAM region from the ACPI MCFG table and hooks the
    /// identity page of every live VMware function in its bus range.
    fn discover_ecam<P>(&self, platform: &mut P)
    where
        P: FirmwareTables + PciConfigSpace + EptHooks,
    {
        let table_size = platform.acpi_table(ACPI_MCFG_SIGNATURE, None);
        if table_size == 0 {
            log::info!("MCFG table not found, skipping PCIe ECAM hooks");
            return;
        }

        let mut table = alloc::vec![0u8; table_size as usize];
        platform.acpi_table(ACPI_MCFG_SIGNATURE, Some(&mut table));

        // Only the first segment group is decoded here; multi-segment
        // systems keep their further groups unhooked.
        let Some(allocation) = acpi::first_allocation(&table) else {
            log::info!("MCFG table too short for an allocation record");
            return;
        };

        let base = allocation.base_address;
        let bus_span = allocation.end_bus.saturating_sub(allocation.start_bus) as u64;

        self.ecam_base.store(base, Ordering::Relaxed);
        self.ecam_size.store(
            4096 * (bus_span * DEVICE_MAX_NUM as u64 * FUNCTION_MAX_NUM as u64),
            Ordering::Relaxed,
        );

        for bus in allocation.start_bus..=allocation.end_bus {
            for device in 0..DEVICE_MAX_NUM {
                for function in 0..FUNCTION_MAX_NUM {
                    let id = platform.read_cam(bus, device, function, 0, size_of::<u64>());
                    if id == u64::MAX {
                        continue;
                    }

                    let vendor_id = (id & 0xFFFF) as u16;
                    if vendor_id != VMWARE_PCI_VENDOR_ID {
                        continue;
                    }

                    let page = ecam_function_base(base, bus, device, function);
                    let hooked =
                        platform.hook_ecam_page(ECAM_SPOOF_VENDOR_ID, ECAM_SPOOF_DEVICE_ID, page);

                    log::info!(
                        "ECAM function base {:#x}, hook installed: {}",
                        page.as_u64(),
                        hooked
                    );
                }
            }
        }
    }
}

#[cfg(test)]
impl TransparencyState {
    /// A detached state for exercising the vm-exit paths without going
    /// through the enable flow.
    pub(crate) fn for_tests(enabled: bool, rand: u32) -> Self {
        let state = Self::new();
        state.enabled.store(enabled, Ordering::Relaxed);
        state.rand.store(rand, Ordering::Relaxed);
        state
    }
}

/// One step of the Lehmer (MINSTD) linear congruential generator, applied
/// to the folded clock so the seed is not simply the raw time.
fn lehmer_step(seed: u32) -> u32 {
    ((seed as u64).wrapping_mul(48271) % 0x7FFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acpi::tests::build_mcfg;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakePlatform {
        mcfg: Option<Vec<u8>>,
        identities: BTreeMap<(u8, u8, u8), u64>,
        hooks: Vec<(u16, u16, u64)>,
        broadcasts: Vec<u32>,
        time: u64,
    }

    impl FirmwareTables for FakePlatform {
        fn acpi_table(&mut self, signature: u32, buffer: Option<&mut [u8]>) -> u32 {
            assert_eq!(signature, ACPI_MCFG_SIGNATURE);
            let Some(table) = &self.mcfg else {
                return 0;
            };
            if let Some(buffer) = buffer {
                buffer[..table.len()].copy_from_slice(table);
            }
            table.len() as u32
        }
    }

    impl PciConfigSpace for FakePlatform {
        fn read_cam(&mut self, bus: u8, device: u8, function: u8, offset: u8, width: usize) -> u64 {
            assert_eq!(offset, 0);
            assert_eq!(width, 8);
            self.identities
                .get(&(bus, device, function))
                .copied()
                .unwrap_or(u64::MAX)
        }
    }

    impl EptHooks for FakePlatform {
        fn hook_ecam_page(&mut self, vendor_id: u16, device_id: u16, page: x86_64::PhysAddr) -> bool {
            self.hooks.push((vendor_id, device_id, page.as_u64()));
            true
        }
    }

    impl CoreBroadcast for FakePlatform {
        fn io_bitmap_change_all_cores(&mut self, port: u32) {
            self.broadcasts.push(port);
        }
    }

    impl SystemClock for FakePlatform {
        fn precise_time(&mut self) -> u64 {
            self.time
        }
    }

    #[test]
    fn enable_is_rejected_when_already_enabled() {
        let state = TransparencyState::new();
        let mut platform = FakePlatform {
            time: 0x1234_5678_9ABC_DEF0,
            ..Default::default()
        };

        assert_eq!(state.hide_debugger(&mut platform), Ok(()));
        assert!(state.is_enabled());
        assert_eq!(
            state.hide_debugger(&mut platform),
            Err(HypervisorError::TransparentModeAlreadyEnabled)
        );
    }

    #[test]
    fn disable_is_rejected_when_already_disabled() {
        let state = TransparencyState::new();

        assert_eq!(
            state.unhide_debugger(),
            Err(HypervisorError::TransparentModeAlreadyDisabled)
        );

        let mut platform = FakePlatform {
            time: 1,
            ..Default::default()
        };
        state.hide_debugger(&mut platform).unwrap();

        assert_eq!(state.unhide_debugger(), Ok(()));
        assert!(!state.is_enabled());
        assert_eq!(
            state.unhide_debugger(),
            Err(HypervisorError::TransparentModeAlreadyDisabled)
        );
    }

    #[test]
    fn enable_broadcasts_the_cam_ports_in_order() {
        let state = TransparencyState::new();
        let mut platform = FakePlatform {
            time: 42,
            ..Default::default()
        };

        state.hide_debugger(&mut platform).unwrap();

        assert_eq!(platform.broadcasts, vec![0xCFC, 0xCFD, 0xCFE, 0xCFF, 0xCF8]);
    }

    #[test]
    fn missing_mcfg_is_a_soft_failure() {
        let state = TransparencyState::new();
        let mut platform = FakePlatform {
            time: 42,
            ..Default::default()
        };

        assert_eq!(state.hide_debugger(&mut platform), Ok(()));
        assert_eq!(state.ecam_region(), (0, 0));
        assert!(platform.hooks.is_empty());
        // The CAM port traps still go out.
        assert_eq!(platform.broadcasts.len(), 5);
    }

    #[test]
    fn discovery_hooks_live_vmware_functions() {
        let state = TransparencyState::new();
        let mut platform = FakePlatform {
            mcfg: Some(build_mcfg(0xE000_0000, 0, 1)),
            time: 42,
            ..Default::default()
        };
        // A VMware function, an Intel function, and silence elsewhere.
        platform.identities.insert((0, 2, 0), 0x0000_0405_15AD);
        platform.identities.insert((0, 3, 0), 0x0000_1234_8086);
        platform.identities.insert((1, 0, 1), 0x0000_07B0_15AD);

        state.hide_debugger(&mut platform).unwrap();

        let (base, size) = state.ecam_region();
        assert_eq!(base, 0xE000_0000);
        assert_eq!(size, 4096 * 1 * 32 * 8);

        assert_eq!(
            platform.hooks,
            vec![
                (0x8086, 0x244E, 0xE000_0000 + (2 << 15)),
                (0x8086, 0x244E, 0xE000_0000 + (1 << 20) + (1 << 12)),
            ]
        );
    }

    #[test]
    fn seed_is_derived_once_and_kept_for_the_session() {
        let state = TransparencyState::new();
        let mut platform = FakePlatform {
            time: 0xDEAD_BEEF_0000_0001,
            ..Default::default()
        };

        state.hide_debugger(&mut platform).unwrap();
        let seed = state.rand();
        assert_ne!(seed, 0);
        assert_eq!(seed, lehmer_step(0xDEAD_BEEF ^ 0x0000_0001));

        // Re-enabling with a different clock must not re-roll the seed.
        state.unhide_debugger().unwrap();
        platform.time = 0x1111_2222_3333_4444;
        state.hide_debugger(&mut platform).unwrap();
        assert_eq!(state.rand(), seed);
    }
}
