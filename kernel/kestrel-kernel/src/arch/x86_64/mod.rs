//! x86_64 bring-up glue: GDT/TSS, SMP startup. Everything else CPU-level
//! (IDT structures, port I/O, control/model-specific registers, segment
//! instructions) lives in [`kestrel_core::arch::x86_64`] and
//! [`kestrel_interrupts`].

pub mod gdt;
pub mod smp;
pub mod tlb;
