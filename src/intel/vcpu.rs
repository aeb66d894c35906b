use crate::error::HypervisorError;
use crate::intel::bitmap::IoBitmap;
use alloc::boxed::Box;

/// Per-logical-processor state owned by the core that runs it; no field
/// here is ever touched from another core, so nothing needs locking.
pub struct Vcpu {
    /// The index of the processor.
    index: u32,

    /// The I/O bitmaps referenced by this processor's VMCS.
    pub io_bitmap: Box<IoBitmap>,

    /// The most recent value the guest wrote to the PCI configuration
    /// address port. Mirrors the hardware `0xCF8` latch, which is
    /// per-logical-processor state on real machines as well.
    pub last_pci_config_address: u32,
}

impl Vcpu {
    pub fn new(index: u32) -> Result<Self, HypervisorError> {
        log::trace!("Creating processor {}", index);

        Ok(Self {
            index,
            io_bitmap: IoBitmap::new()?,
            last_pci_config_address: 0,
        })
    }

    /// Gets the index of the current logical/virtual processor.
    pub fn id(&self) -> u32 {
        self.index
    }
}
