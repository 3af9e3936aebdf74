//! Small identifier types shared across the kernel.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifies a logical CPU.
///
/// CPU 0 is always the bootstrap processor. Values are assigned during SMP
/// bring-up and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor's id.
    pub const BSP: Self = Self(0);

    /// Wraps a raw CPU index.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw CPU index.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the raw CPU index as a `usize`, for array indexing.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a thread within the kernel.
///
/// Thread ids are allocated from a monotonically increasing counter; id 0
/// is reserved for the idle thread of each CPU and is never handed out by
/// [`ThreadIdAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The reserved id shared by every CPU's idle thread.
    pub const IDLE: Self = Self(0);

    /// Wraps a raw thread id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw thread id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Monotonic allocator for [`ThreadId`] values.
///
/// Ids start at 1; 0 is reserved for idle threads and is never returned by
/// [`Self::alloc`].
pub struct ThreadIdAllocator {
    next: AtomicU64,
}

impl ThreadIdAllocator {
    /// Creates a new allocator whose first [`Self::alloc`] call returns id 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocates the next thread id.
    pub fn alloc(&self) -> ThreadId {
        ThreadId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ThreadIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic allocator for CPU-local sequential indices, used during SMP
/// bring-up to hand each application processor its [`CpuId`] in turn.
pub struct CpuIdAllocator {
    next: AtomicU32,
}

impl CpuIdAllocator {
    /// Creates a new allocator whose first [`Self::alloc`] call returns
    /// [`CpuId::BSP`].
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Allocates the next CPU id.
    pub fn alloc(&self) -> CpuId {
        CpuId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the number of ids handed out so far.
    pub fn count(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for CpuIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_monotonic_and_skip_zero() {
        let alloc = ThreadIdAllocator::new();
        assert_eq!(alloc.alloc(), ThreadId::new(1));
        assert_eq!(alloc.alloc(), ThreadId::new(2));
        assert_eq!(alloc.alloc(), ThreadId::new(3));
        assert_ne!(ThreadId::IDLE, ThreadId::new(1));
    }

    #[test]
    fn cpu_id_allocator_starts_at_bsp() {
        let alloc = CpuIdAllocator::new();
        assert_eq!(alloc.alloc(), CpuId::BSP);
        assert_eq!(alloc.alloc(), CpuId::new(1));
        assert_eq!(alloc.count(), 2);
    }
}
