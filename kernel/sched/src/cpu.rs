//! Per-CPU ready queue.
//!
//! Each CPU's queue is reached through [`kestrel_core::percpu::CpuLocal`],
//! the same indexed-by-`CpuId` table `kestrel-core` uses for its own
//! per-CPU state; `kestrel-core` never looks inside a [`CpuScheduler`], it
//! only stores the opaque pointer handed to [`PerCpu::set_scheduler_data`].

use alloc::collections::VecDeque;

use kestrel_core::percpu::{self, CpuLocal, MAX_CPUS};
use kestrel_core::sync::IrqSpinLock;

use crate::thread::Thread;

/// A single CPU's ready queue. FIFO; any fairer policy is future work.
pub struct CpuScheduler {
    ready: IrqSpinLock<VecDeque<*mut Thread>>,
}

// SAFETY: every pointer in `ready` is a `Box::into_raw` leaked `Thread`
// moved between queues and the currently-running slot under the queue's
// own lock or the context-switch window; never aliased mutably otherwise.
unsafe impl Send for CpuScheduler {}
unsafe impl Sync for CpuScheduler {}

impl CpuScheduler {
    const fn new() -> Self {
        Self { ready: IrqSpinLock::new(VecDeque::new()) }
    }

    /// Appends `thread` to this CPU's ready queue.
    pub fn enqueue(&self, thread: *mut Thread) {
        self.ready.lock().push_back(thread);
    }

    /// Removes and returns the next ready thread, if any.
    pub fn dequeue(&self) -> Option<*mut Thread> {
        self.ready.lock().pop_front()
    }
}

const EMPTY: CpuScheduler = CpuScheduler::new();

static SCHEDULERS: CpuLocal<CpuScheduler> = CpuLocal::new([EMPTY; MAX_CPUS]);

/// Returns the running CPU's ready queue, installing it as this CPU's
/// scheduler data in [`kestrel_core::percpu::PerCpu`] on first use.
pub fn current() -> &'static CpuScheduler {
    let scheduler = SCHEDULERS.get();
    let cpu = percpu::current_cpu();
    if cpu.scheduler_data().is_null() {
        cpu.set_scheduler_data((scheduler as *const CpuScheduler).cast_mut().cast());
    }
    scheduler
}
