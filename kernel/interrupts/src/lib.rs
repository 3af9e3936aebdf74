//! Interrupt dispatch for Kestrel OS: a priority-partitioned 256-vector
//! table, the IDT that routes hardware vectors into it, and the LAPIC
//! driver used for EOI, IPIs, and the scheduler's preemption timer.
//!
//! Built on `kestrel-core`'s raw IDT/GDT structures and [`MachineState`]
//! diagnostic snapshot; this crate owns the policy of *which* vector maps
//! to *which* handler and how an unhandled exception is reported.
//!
//! [`MachineState`]: kestrel_core::arch::x86_64::structures::machine_state::MachineState

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]

pub mod exceptions;
pub mod idt;
pub mod lapic;
pub mod table;

pub use table::{InterruptError, request, set};
