//! Anti-detection layer for a bare-metal hypervisor debugger.
//!
//! This crate hides the hypervisor from guest-visible hardware probes: it
//! filters `CPUID` results that would reveal a hypervisor, emulates the
//! legacy PCI Configuration Access Mechanism (ports `0xCF8`/`0xCFC`) so
//! that identity reads of selected devices return plausible substitute
//! hardware, and passes every other intercepted I/O access through to real
//! hardware with byte-exact semantics, including string/REP forms.
//!
//! The embedding hypervisor supplies the platform collaborators (firmware
//! table queries, raw PCI reads, EPT page hooks, cross-core broadcast)
//! through the traits in [`platform`], and routes its CPUID and I/O
//! vm-exits to the handlers in [`intel::vmexit`].

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate static_assertions;

extern crate alloc;

pub mod acpi;
pub mod error;
pub mod intel;
pub mod logger;
pub mod pci;
pub mod platform;
pub mod transparency;

pub use error::HypervisorError;
pub use transparency::{TransparencyState, TRANSPARENCY};
