//! Boot-time tuning constants.
//!
//! Mirrors [`kestrel_sched::config`]'s role for the scheduler: a single
//! place for the numbers bring-up needs instead of literals scattered
//! through [`crate::boot`].

/// Upper bound on CPUs this build brings up, mirroring
/// [`kestrel_core::percpu::MAX_CPUS`].
pub const MAX_CPUS: usize = kestrel_core::percpu::MAX_CPUS;

/// Highest [`kestrel_core::log::LogLevel`] the early serial sink accepts.
pub const MAX_LOG_LEVEL: kestrel_core::log::LogLevel = kestrel_core::log::LogLevel::Trace;

/// Crate version, surfaced in the boot banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
