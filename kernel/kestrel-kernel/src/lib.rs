//! Kestrel kernel bring-up: boot glue wiring `kestrel-core`,
//! `kestrel-mm`, `kestrel-interrupts`, and `kestrel-sched` together into a
//! running kernel.
//!
//! Everything this crate owns is "what happens once, at boot, on real
//! hardware": reading the boot protocol's memory map, building the GDT and
//! IDT, starting secondary CPUs, and handing control to the scheduler.
//! The algorithms those four crates implement are not duplicated here.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod config;
pub mod log;
pub mod mm;
pub mod serial;

pub use boot::{BootInfo, kernel_init};
