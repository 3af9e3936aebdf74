//! Architecture-specific support.
//!
//! Kestrel targets x86_64 only; this module exists so call sites can write
//! `crate::arch::x86_64::...` uniformly and so a future port has a place to
//! land without reshaping callers.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
