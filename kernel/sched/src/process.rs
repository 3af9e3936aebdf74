//! Process descriptors.
//!
//! A process is little more than an address space and a set of threads
//! sharing it. The address space itself lives in `kestrel-mm`, generic over
//! the page-mapper type in use; a process only ever needs its CR3 value, so
//! it holds that as an opaque [`PhysAddr`] rather than the full
//! `AddressSpace<M>` — this keeps `kestrel-sched` free of `kestrel-mm`'s
//! mapper type parameter. Tearing down the backing address space (freeing
//! its PML4 and mapped pages) is the caller's responsibility before the
//! last thread referencing a `Process` is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::addr::PhysAddr;
use kestrel_core::id::ThreadId;
use kestrel_core::sync::SpinLock;

/// A process: an address space and the threads running in it.
pub struct Process {
    /// Physical address of this process's page table root, loaded into CR3
    /// by [`crate::context::sched_switch`] whenever one of its threads is
    /// switched in.
    root_phys: PhysAddr,
    threads: SpinLock<Vec<ThreadId>>,
}

impl Process {
    /// Wraps an already-constructed address space's CR3 value as a process
    /// with no threads yet.
    pub fn new(root_phys: PhysAddr) -> Arc<Self> {
        Arc::new(Self {
            root_phys,
            threads: SpinLock::new(Vec::new()),
        })
    }

    /// Returns the CR3 value for this process's address space.
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Records that `id` is one of this process's threads.
    pub fn add_thread(&self, id: ThreadId) {
        self.threads.lock().push(id);
    }

    /// Removes `id` from this process's thread list, e.g. once the thread
    /// has exited and been reclaimed.
    pub fn remove_thread(&self, id: ThreadId) {
        self.threads.lock().retain(|&t| t != id);
    }

    /// Returns `true` if this process has no threads left.
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }
}
