//! Architecture-specific page-table mapper implementations.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
