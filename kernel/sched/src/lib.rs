//! Per-CPU preemptive thread scheduler for Kestrel OS: thread control
//! blocks, kernel-stack seeding, context switching, and the sleeping
//! synchronization primitives built on top of it.
//!
//! Built on `kestrel-core`'s per-CPU and id infrastructure and
//! `kestrel-mm`'s PMM/HHDM; owns everything about *when* a thread runs that
//! those crates deliberately know nothing about (see
//! [`kestrel_core::sync`]'s module documentation).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod auxv;
pub mod config;
pub mod context;
pub mod cpu;
pub mod process;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod thread;

pub use process::Process;
pub use scheduler::{
    arch_sched_stack_setup, arch_sched_thread_create_kernel, arch_sched_thread_create_user, arch_sched_thread_current,
    arch_sched_thread_destroy, init_cpu, sched_next, set_tss_rsp0_hook,
};
pub use thread::{Thread, ThreadKind, ThreadState};
