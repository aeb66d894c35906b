//! I/O bitmaps controlling which port accesses cause vm-exits.

use crate::error::HypervisorError;
use alloc::boxed::Box;
use bit_field::BitField;
use core::alloc::Layout;

/// Sentinel port value meaning "trap every port".
pub const ALL_IO_PORTS: u32 = u32::MAX;

const PAGE_SIZE: usize = 0x1000;

/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.4
/// I/O-Bitmap Addresses. A logical processor uses these bitmaps if and
/// only if the "use I/O bitmaps" control is 1; an I/O instruction then
/// causes a VM exit when a bit corresponding to one of the bytes it
/// accesses is 1. Both bitmaps must be 4-KByte aligned.
#[repr(C, align(4096))]
pub struct IoBitmap {
    /// I/O bitmap A: one bit per port in the range 0000H to 7FFFH.
    pub a: [u8; PAGE_SIZE],

    /// I/O bitmap B: one bit per port in the range 8000H to FFFFH.
    pub b: [u8; PAGE_SIZE],
}

assert_eq_size!(IoBitmap, [u8; 2 * PAGE_SIZE]);

impl IoBitmap {
    /// Allocates a zeroed bitmap pair: no port traps.
    pub fn new() -> Result<Box<Self>, HypervisorError> {
        // Zeroed heap allocation without staging 8 KiB on the kernel stack.
        let pointer = unsafe { alloc::alloc::alloc_zeroed(Layout::new::<Self>()) }.cast::<Self>();

        if pointer.is_null() {
            return Err(HypervisorError::MemoryAllocationFailed);
        }

        Ok(unsafe { Box::from_raw(pointer) })
    }

    /// Marks `port` so that guest accesses to it cause a vm-exit.
    pub fn set_bit(&mut self, port: u32) -> Result<(), HypervisorError> {
        match port {
            0..=0x7FFF => {
                let bit = port as usize;
                self.a[bit / 8].set_bit(bit % 8, true);
            }
            0x8000..=0xFFFF => {
                let bit = (port - 0x8000) as usize;
                self.b[bit / 8].set_bit(bit % 8, true);
            }
            _ => return Err(HypervisorError::InvalidIoPort),
        }

        Ok(())
    }

    /// Applies one bitmap change on the current core: the [`ALL_IO_PORTS`]
    /// sentinel traps everything, any other value traps that single port.
    pub fn apply_change(&mut self, port: u32) -> Result<(), HypervisorError> {
        if port == ALL_IO_PORTS {
            self.a.fill(0xFF);
            self.b.fill(0xFF);
            Ok(())
        } else {
            self.set_bit(port)
        }
    }

    /// Clears both bitmaps: no port traps.
    pub fn reset(&mut self) {
        self.a.fill(0);
        self.b.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_set(bytes: &[u8], bit: usize) -> bool {
        bytes[bit / 8].get_bit(bit % 8)
    }

    #[test]
    fn bitmap_a_boundary() {
        let mut bitmap = IoBitmap::new().unwrap();
        bitmap.set_bit(0x7FFF).unwrap();

        assert!(is_set(&bitmap.a, 0x7FFF));
        assert!(bitmap.b.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn bitmap_b_boundary() {
        let mut bitmap = IoBitmap::new().unwrap();
        bitmap.set_bit(0x8000).unwrap();

        assert!(is_set(&bitmap.b, 0));
        assert!(bitmap.a.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn out_of_range_port_leaves_bitmaps_untouched() {
        let mut bitmap = IoBitmap::new().unwrap();

        assert_eq!(bitmap.set_bit(0x10000), Err(HypervisorError::InvalidIoPort));
        assert!(bitmap.a.iter().all(|byte| *byte == 0));
        assert!(bitmap.b.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn pci_config_ports_land_in_bitmap_a() {
        let mut bitmap = IoBitmap::new().unwrap();
        bitmap.set_bit(0xCF8).unwrap();
        bitmap.set_bit(0xCFC).unwrap();

        assert!(is_set(&bitmap.a, 0xCF8));
        assert!(is_set(&bitmap.a, 0xCFC));
        assert!(!is_set(&bitmap.a, 0xCF9));
    }

    #[test]
    fn all_ports_sentinel_fills_both_bitmaps() {
        let mut bitmap = IoBitmap::new().unwrap();
        bitmap.apply_change(ALL_IO_PORTS).unwrap();

        assert!(bitmap.a.iter().all(|byte| *byte == 0xFF));
        assert!(bitmap.b.iter().all(|byte| *byte == 0xFF));

        bitmap.reset();
        assert!(bitmap.a.iter().all(|byte| *byte == 0));
        assert!(bitmap.b.iter().all(|byte| *byte == 0));
    }
}
