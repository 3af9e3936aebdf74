//! Scheduler tuning constants.
//!
//! Centralized here rather than scattered across `thread.rs`/`stack.rs` so a
//! single place answers "how big is a kernel stack" or "how often does the
//! timer fire".

/// Number of 4 KiB pages backing a kernel thread's stack.
pub const KERNEL_STACK_PAGES: usize = 16;

/// Number of 4 KiB pages backing a user thread's initial user-mode stack.
pub const USER_STACK_PAGES: usize = 8;

/// Required alignment, in bytes, of the buffer `fxsave`/`xsave` write into.
pub const FPU_STATE_ALIGN: usize = 64;

/// Size, in bytes, of the legacy `fxsave` area. Large enough to also hold
/// the common `xsave` legacy region; extended state beyond it is not saved.
pub const FPU_STATE_SIZE: usize = 512;

/// LAPIC timer reload value, in bus-clock units (post divide-by-16), for one
/// scheduling quantum.
pub const TIMER_QUANTUM_TICKS: u32 = 100_000;
