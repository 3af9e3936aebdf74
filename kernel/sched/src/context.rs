//! The context switch and the trampoline a freshly created thread's first
//! switch-in lands in.
//!
//! [`sched_switch`] only ever saves/restores the System V callee-saved
//! registers (`rbp, rbx, r12-r15`) plus the stack pointer — everything else
//! is already accounted for by whatever put the outgoing thread on the
//! stack in the first place (the `extern "x86-interrupt"` ABI for a
//! preempted thread, or the seeded frame in [`crate::stack::KernelStack`]
//! for a thread that has never run). `rdi` is never touched by the routine,
//! so it still holds `prev` when the final `ret` lands: for a fresh thread
//! that return address is [`thread_trampoline`], which therefore receives
//! `prev` as its first argument exactly as if it had been called normally.

use crate::scheduler;
use crate::thread::{Thread, ThreadKind};

/// Switches the CPU from `prev` to `next`.
///
/// Saves `prev`'s callee-saved registers and stack pointer, then loads
/// `next`'s. Does not touch CR3, the TSS, or the FPU state — those are the
/// caller's job (see [`crate::scheduler::switch_to`]), which handles them
/// on every switch, not just a thread's first.
///
/// # Safety
///
/// `prev` and `next` must be valid, non-aliasing pointers to live `Thread`s.
/// `next` must not already be running on another CPU.
#[unsafe(naked)]
pub unsafe extern "C" fn sched_switch(prev: *mut Thread, next: *mut Thread) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// GDT selector for the user data segment (RPL=3). Must match the layout
/// `kestrel-kernel`'s GDT installs: null, kernel_code, kernel_data,
/// user_data, user_code, tss — user_data before user_code, as SYSRET's
/// `STAR` encoding requires.
const USER_DATA_SELECTOR: u64 = 0x1B;
/// GDT selector for the user code segment (RPL=3).
const USER_CODE_SELECTOR: u64 = 0x23;
/// Initial user RFLAGS: interrupts enabled, reserved bit 1 set.
const USER_RFLAGS: u64 = 0x202;

/// Transitions to ring 3 at `entry` with stack pointer `user_stack`, never
/// returning. All general-purpose registers are zeroed first so no kernel
/// state leaks into the new thread.
///
/// # Safety
///
/// `entry` and `user_stack` must be valid, mapped user-mode addresses in
/// the address space already loaded into CR3.
#[unsafe(naked)]
unsafe extern "C" fn enter_userspace(entry: u64, user_stack: u64) -> ! {
    core::arch::naked_asm!(
        "push {user_ds}",
        "push rsi",
        "push {rflags}",
        "push {user_cs}",
        "push rdi",
        "xor rax, rax",
        "xor rbx, rbx",
        "xor rcx, rcx",
        "xor rdx, rdx",
        "xor rsi, rsi",
        "xor rdi, rdi",
        "xor rbp, rbp",
        "xor r8, r8",
        "xor r9, r9",
        "xor r10, r10",
        "xor r11, r11",
        "xor r12, r12",
        "xor r13, r13",
        "xor r14, r14",
        "xor r15, r15",
        "iretq",
        user_ds = const USER_DATA_SELECTOR,
        user_cs = const USER_CODE_SELECTOR,
        rflags = const USER_RFLAGS,
    );
}

/// The landing point for every thread's first [`sched_switch`] into it.
///
/// Runs with `prev` in hand (the thread just switched away from), finishes
/// its teardown if it had exited, then dispatches into the new thread's
/// [`ThreadKind`].
pub extern "C" fn thread_trampoline(prev: *mut Thread) -> ! {
    scheduler::common_thread_init(prev);

    let current = kestrel_core::percpu::current_cpu().current_thread().cast::<Thread>();
    // SAFETY: `current` was just installed by `common_thread_init` (via
    // `sched_next`) and points at the thread now running on this CPU.
    let thread = unsafe { &*current };

    match thread.kind {
        ThreadKind::Kernel { entry } => {
            // SAFETY: the IDT is installed before any thread can run.
            unsafe { kestrel_core::arch::x86_64::instructions::interrupts::enable() };
            entry()
        }
        ThreadKind::User { entry, user_stack } => {
            // SAFETY: `entry`/`user_stack` were validated when the thread
            // was created, against the address space just loaded above.
            unsafe { enter_userspace(entry, user_stack) }
        }
    }
}

