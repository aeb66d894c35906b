//! Serial logging setup.
//!
//! Post-vmlaunch the kernel logger is unusable, so logging goes out over a
//! COM port instead; under VMware Workstation the host picks this up from
//! the virtual serial device.

use log::LevelFilter;

/// Base I/O port of the COM2 serial device.
pub const COM2_PORT: u16 = 0x2f8;

/// Initializes the COM2 port logger with the given level filter.
///
/// Call once from the driver entry before any processor is virtualized.
pub fn init(level: LevelFilter) {
    com_logger::builder().base(COM2_PORT).filter(level).setup();
}
