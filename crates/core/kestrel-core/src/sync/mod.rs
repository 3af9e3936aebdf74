//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`], [`IrqSpinLock`], and [`LazyLock`] suitable for use
//! in `static` items and usable before any allocator or scheduler is
//! available. Sleeping primitives that block a thread rather than spin
//! (mutexes, wait queues) live in `kestrel-sched`, since they need to know
//! how to suspend and resume a thread.

mod irq_spinlock;
mod lazy;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
