//! Sleeping synchronization primitives.
//!
//! `kestrel-core`'s [`kestrel_core::sync::SpinLock`] and
//! [`kestrel_core::sync::IrqSpinLock`] never park a thread — a holder that
//! blocks while those are held would deadlock the CPU. [`Mutex`] and
//! [`WaitQueue`] here instead transition the waiter to
//! [`crate::thread::ThreadState::Blocked`] and fall into [`sched_next`],
//! resuming only once another thread explicitly wakes it.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use kestrel_core::sync::SpinLock;

use crate::scheduler::{self, sched_next};
use crate::thread::{Thread, ThreadState};

/// A queue of threads parked waiting for some condition.
///
/// Threads are identified by the raw pointer the scheduler already uses to
/// track them; [`WaitQueue`] never dereferences them except to flip their
/// state and hand them back to the ready queue.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<*mut Thread>>,
}

// SAFETY: the contained pointers only ever move between this queue and the
// per-CPU ready queue, each guarded by its own lock.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self { waiters: SpinLock::new(VecDeque::new()) }
    }

    /// Parks the running thread on this queue and yields the CPU. Returns
    /// once another thread calls [`Self::wake_one`] or [`Self::wake_all`]
    /// and this thread is rescheduled.
    pub fn wait(&self) {
        let current = scheduler::arch_sched_thread_current();
        // SAFETY: `current` is the thread calling `wait`, never aliased
        // while it blocks itself.
        unsafe { (*current).set_state(ThreadState::Blocked) };
        self.waiters.lock().push_back(current);
        sched_next();
    }

    /// Wakes the longest-waiting thread on this queue, if any.
    pub fn wake_one(&self) {
        if let Some(thread) = self.waiters.lock().pop_front() {
            wake(thread);
        }
    }

    /// Wakes every thread currently on this queue.
    pub fn wake_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(thread) = waiters.pop_front() {
            wake(thread);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn wake(thread: *mut Thread) {
    // SAFETY: `thread` was parked by `WaitQueue::wait` and has not run
    // since; only the waker touches its state here.
    unsafe { (*thread).set_state(ThreadState::Ready) };
    scheduler::cpu_enqueue(thread);
}

/// A mutex that blocks a contending thread rather than spinning.
pub struct Mutex<T> {
    locked: SpinLock<bool>,
    waiters: WaitQueue,
    value: UnsafeCell<T>,
}

// SAFETY: `value` is only ever reachable through a held `MutexGuard`, and
// `locked` enforces exclusivity.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked mutex wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: SpinLock::new(false),
            waiters: WaitQueue::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, blocking the calling thread if it is already
    /// held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut locked = self.locked.lock();
            if !*locked {
                *locked = true;
                return MutexGuard { mutex: self };
            }
            drop(locked);
            self.waiters.wait();
        }
    }
}

/// RAII guard returned by [`Mutex::lock`].
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves exclusive access.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        *self.mutex.locked.lock() = false;
        self.mutex.waiters.wake_one();
    }
}
