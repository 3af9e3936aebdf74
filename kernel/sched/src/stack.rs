//! Kernel-stack allocation and initial-frame seeding.
//!
//! A thread's kernel stack is a run of physical frames from the PMM,
//! accessed through the HHDM rather than given a dedicated kernel-space
//! virtual mapping — every physical frame is already reachable that way, and
//! a thread's stack needs no other virtual-address property (no guard page,
//! no fixed location). `kestrel-sched` therefore never touches a page
//! mapper directly.

use kestrel_core::addr::VirtAddr;
use kestrel_mm::pmm::{self, AllocFlags, Page};

use crate::config;

/// Number of `u64` slots reserved at the top of a fresh stack for the
/// initial callee-saved-register frame: `r15, r14, r13, r12, rbx, rbp`,
/// plus the return address `sched_switch`'s `ret` lands on.
const SEED_SLOTS: u64 = 7;

/// A thread's kernel stack.
pub struct KernelStack {
    page: Page,
    pages: usize,
}

impl KernelStack {
    /// Allocates a fresh `pages`-page kernel stack and seeds it so that the
    /// first [`crate::context::sched_switch`] into this thread lands in
    /// `entry_trampoline` with `rdi` holding whatever `prev` was passed to
    /// `sched_switch`.
    pub fn new(pages: usize, entry_trampoline: extern "C" fn(*mut crate::thread::Thread) -> !) -> Self {
        let page = pmm::alloc_pages(pages, AllocFlags::empty()).expect("out of memory allocating kernel stack");
        let stack = Self { page, pages };
        stack.seed(entry_trampoline);
        stack
    }

    fn top(&self) -> VirtAddr {
        kestrel_mm::hhdm::phys_to_virt(self.page.addr()) + (self.pages * kestrel_mm::PAGE_SIZE) as u64
    }

    fn seed(&self, entry_trampoline: extern "C" fn(*mut crate::thread::Thread) -> !) {
        let base = (self.top().as_u64() - SEED_SLOTS * 8) as *mut u64;
        // SAFETY: `base` falls within the stack just allocated above, which
        // is at least `SEED_SLOTS * 8` bytes and nothing else references it
        // yet.
        unsafe {
            base.add(0).write(0); // r15
            base.add(1).write(0); // r14
            base.add(2).write(0); // r13
            base.add(3).write(0); // r12
            base.add(4).write(0); // rbx
            base.add(5).write(0); // rbp
            base.add(6).write(entry_trampoline as usize as u64); // return address
        }
    }

    /// The stack pointer a freshly seeded (or switched-out) thread resumes
    /// from.
    pub(crate) fn initial_rsp(&self) -> u64 {
        self.top().as_u64() - SEED_SLOTS * 8
    }

    /// Top of the usable stack range, for diagnostics.
    pub fn top_addr(&self) -> VirtAddr {
        self.top()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        pmm::free(self.page);
    }
}

/// Allocates a kernel-thread stack using the configured default page count.
pub fn alloc_kernel_stack(entry_trampoline: extern "C" fn(*mut crate::thread::Thread) -> !) -> KernelStack {
    KernelStack::new(config::KERNEL_STACK_PAGES, entry_trampoline)
}

/// Allocates the kernel-side stack a user thread traps into the kernel on
/// (syscalls, interrupts, page faults). Separate from the user-mode stack
/// itself, which lives in the process's address space.
pub fn alloc_user_kernel_stack(entry_trampoline: extern "C" fn(*mut crate::thread::Thread) -> !) -> KernelStack {
    KernelStack::new(config::KERNEL_STACK_PAGES, entry_trampoline)
}
