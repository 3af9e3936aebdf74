//! Thread control blocks.
//!
//! A [`Thread`] is the unit the scheduler switches between. Kernel threads
//! run an `extern "C" fn() -> !` directly; user threads resume in ring 3 at
//! a saved entry point and stack. Both kinds share the same saved-context
//! and kernel-stack machinery in [`crate::context`]/[`crate::stack`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kestrel_core::id::ThreadId;

use crate::config;
use crate::process::Process;
use crate::stack::KernelStack;

/// Where a thread resumes once the scheduler switches into it.
pub enum ThreadKind {
    /// Runs `entry` in ring 0 with interrupts enabled, sharing the kernel
    /// address space.
    Kernel { entry: extern "C" fn() -> ! },
    /// Resumes in ring 3 at `entry` with stack pointer `user_stack`.
    User { entry: u64, user_stack: u64 },
}

/// A thread's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Sitting in a CPU's ready queue, eligible to be switched in.
    Ready,
    /// The thread currently loaded on some CPU.
    Running,
    /// Waiting on a sleeping primitive ([`crate::sync::Mutex`],
    /// [`crate::sync::WaitQueue`]); not present in any ready queue.
    Blocked,
    /// Exited; [`crate::scheduler::thread_drop`] will reclaim it the next
    /// time it is switched away from.
    Exited,
}

/// FPU/SSE state buffer, aligned for `fxsave`/`fxrstor`.
#[repr(align(64))]
pub struct FpuState(pub [u8; config::FPU_STATE_SIZE]);

impl FpuState {
    const fn new() -> Self {
        Self([0; config::FPU_STATE_SIZE])
    }
}

/// A thread control block.
///
/// `#[repr(C)]` with `rsp` as the first field gives [`crate::context::sched_switch`]
/// a fixed offset-0 slot to save and load the stack pointer through, without
/// needing `core::mem::offset_of!` in the naked routine.
#[repr(C)]
pub struct Thread {
    /// Saved stack pointer. Valid only while this thread is not the one
    /// currently running; written and read exclusively by
    /// [`crate::context::sched_switch`].
    pub(crate) rsp: u64,
    /// This thread's id. `ThreadId::IDLE` for every CPU's idle thread.
    pub id: ThreadId,
    state: AtomicU32,
    /// The process this thread belongs to, or `None` for a kernel thread
    /// with no user-mode address space.
    pub process: Option<Arc<Process>>,
    /// The CPU this thread last ran on (or is assigned to), as a raw
    /// [`kestrel_core::id::CpuId`] value.
    cpu: AtomicU32,
    /// Where this thread resumes on its first (or next) switch-in.
    pub(crate) kind: ThreadKind,
    /// This thread's kernel stack. Owned for the thread's whole lifetime;
    /// freed when the thread is dropped.
    pub(crate) kernel_stack: KernelStack,
    /// `FSBASE`/`GSBASE` MSR values for a user thread using thread-local
    /// storage. Unused by kernel threads.
    user_fs_base: AtomicU64,
    user_gs_base: AtomicU64,
    /// Saved FPU/SSE register file, restored on every switch-in.
    pub(crate) fpu: FpuState,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        process: Option<Arc<Process>>,
        kind: ThreadKind,
        kernel_stack: KernelStack,
    ) -> Self {
        Self {
            rsp: kernel_stack.initial_rsp(),
            id,
            state: AtomicU32::new(ThreadState::Ready as u32),
            process,
            cpu: AtomicU32::new(0),
            kind,
            kernel_stack,
            user_fs_base: AtomicU64::new(0),
            user_gs_base: AtomicU64::new(0),
            fpu: FpuState::new(),
        }
    }

    /// Returns this thread's current state.
    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Exited,
        }
    }

    /// Transitions this thread to `state`.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Returns the CPU this thread is assigned to.
    pub fn cpu(&self) -> kestrel_core::id::CpuId {
        kestrel_core::id::CpuId::new(self.cpu.load(Ordering::Relaxed))
    }

    /// Records which CPU this thread is assigned to.
    pub fn set_cpu(&self, cpu: kestrel_core::id::CpuId) {
        self.cpu.store(cpu.as_u32(), Ordering::Relaxed);
    }

    /// Returns this thread's `FSBASE` value.
    pub fn fs_base(&self) -> u64 {
        self.user_fs_base.load(Ordering::Relaxed)
    }

    /// Sets this thread's `FSBASE` value, applied on its next switch-in.
    pub fn set_fs_base(&self, base: u64) {
        self.user_fs_base.store(base, Ordering::Relaxed);
    }

    /// Returns this thread's `GSBASE` value.
    pub fn gs_base(&self) -> u64 {
        self.user_gs_base.load(Ordering::Relaxed)
    }

    /// Sets this thread's `GSBASE` value, applied on its next switch-in.
    pub fn set_gs_base(&self, base: u64) {
        self.user_gs_base.store(base, Ordering::Relaxed);
    }
}
