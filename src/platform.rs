//! Interfaces to the surrounding hypervisor and kernel.
//!
//! The transparency layer never talks to firmware, the EPT machinery, or
//! other cores directly. Everything it needs from its host environment is
//! expressed as a trait here, implemented by the embedding driver against
//! the real kernel primitives. Tests substitute in-memory fakes.

use crate::intel::support;
use x86_64::PhysAddr;

/// Sized port I/O primitives, scalar and string/REP forms.
///
/// Implementations execute on the current logical processor in vmx-root
/// mode. The string forms read or write guest memory through the raw
/// pointer captured from the guest's RSI/RDI, so they carry the usual
/// raw-pointer contract.
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;
    fn inw(&mut self, port: u16) -> u16;
    fn inl(&mut self, port: u16) -> u32;

    fn outb(&mut self, port: u16, value: u8);
    fn outw(&mut self, port: u16, value: u16);
    fn outl(&mut self, port: u16, value: u32);

    /// # Safety
    ///
    /// `buffer` must be valid for writes of `count` elements.
    unsafe fn insb(&mut self, port: u16, buffer: *mut u8, count: u32);
    /// # Safety
    ///
    /// `buffer` must be valid for writes of `count` elements.
    unsafe fn insw(&mut self, port: u16, buffer: *mut u16, count: u32);
    /// # Safety
    ///
    /// `buffer` must be valid for writes of `count` elements.
    unsafe fn insl(&mut self, port: u16, buffer: *mut u32, count: u32);

    /// # Safety
    ///
    /// `buffer` must be valid for reads of `count` elements.
    unsafe fn outsb(&mut self, port: u16, buffer: *const u8, count: u32);
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `count` elements.
    unsafe fn outsw(&mut self, port: u16, buffer: *const u16, count: u32);
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `count` elements.
    unsafe fn outsl(&mut self, port: u16, buffer: *const u32, count: u32);
}

/// Raw PCI configuration space reads through the platform's own access
/// mechanism, independent of the guest-visible CAM emulation.
pub trait PciConfigSpace {
    /// Reads `width` bytes (1, 2, 4 or 8) at `offset` of the given
    /// function's configuration space. A function that does not respond
    /// returns all-ones.
    fn read_cam(&mut self, bus: u8, device: u8, function: u8, offset: u8, width: usize) -> u64;
}

/// ACPI firmware table retrieval.
pub trait FirmwareTables {
    /// Returns the size in bytes of the table with the given signature, or
    /// 0 when the table is not present. When `buffer` is provided and large
    /// enough, the table contents are copied into it.
    ///
    /// Callers use the two-call protocol: query with `None` for the size,
    /// allocate, then query again to fill.
    fn acpi_table(&mut self, signature: u32, buffer: Option<&mut [u8]>) -> u32;
}

/// Installer for EPT hooks over memory-mapped (ECAM) configuration pages.
pub trait EptHooks {
    /// Hooks the 4 KiB ECAM page at `page` so that guest reads of the
    /// function's identity registers observe `vendor_id`:`device_id`.
    /// Returns whether the hook was installed.
    fn hook_ecam_page(&mut self, vendor_id: u16, device_id: u16, page: PhysAddr) -> bool;
}

/// Cross-core delivery of I/O bitmap changes.
///
/// Bitmap mutation must run on the core that owns the bitmap, so the
/// implementation is expected to IPI every logical processor and apply
/// [`crate::intel::bitmap::IoBitmap::apply_change`] there, synchronously,
/// before returning.
pub trait CoreBroadcast {
    fn io_bitmap_change_all_cores(&mut self, port: u32);
}

/// High-resolution system clock, used once to derive the spoofing seed.
pub trait SystemClock {
    /// Current system time at the highest available resolution.
    fn precise_time(&mut self) -> u64;
}

/// [`PortIo`] implementation that executes the in/out instructions on the
/// current processor.
pub struct RawPortIo;

impl PortIo for RawPortIo {
    fn inb(&mut self, port: u16) -> u8 {
        unsafe { support::inb(port) }
    }

    fn inw(&mut self, port: u16) -> u16 {
        unsafe { support::inw(port) }
    }

    fn inl(&mut self, port: u16) -> u32 {
        unsafe { support::inl(port) }
    }

    fn outb(&mut self, port: u16, value: u8) {
        unsafe { support::outb(port, value) }
    }

    fn outw(&mut self, port: u16, value: u16) {
        unsafe { support::outw(port, value) }
    }

    fn outl(&mut self, port: u16, value: u32) {
        unsafe { support::outl(port, value) }
    }

    unsafe fn insb(&mut self, port: u16, buffer: *mut u8, count: u32) {
        support::insb(port, buffer, count)
    }

    unsafe fn insw(&mut self, port: u16, buffer: *mut u16, count: u32) {
        support::insw(port, buffer, count)
    }

    unsafe fn insl(&mut self, port: u16, buffer: *mut u32, count: u32) {
        support::insl(port, buffer, count)
    }

    unsafe fn outsb(&mut self, port: u16, buffer: *const u8, count: u32) {
        support::outsb(port, buffer, count)
    }

    unsafe fn outsw(&mut self, port: u16, buffer: *const u16, count: u32) {
        support::outsw(port, buffer, count)
    }

    unsafe fn outsl(&mut self, port: u16, buffer: *const u32, count: u32) {
        support::outsl(port, buffer, count)
    }
}
