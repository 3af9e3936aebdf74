//! The scheduler's external surface: thread creation/destruction, the
//! preemption tick, and CPU bring-up.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::id::{CpuId, ThreadId, ThreadIdAllocator};
use kestrel_core::percpu;

use crate::auxv;
use crate::config;
use crate::context::{self, thread_trampoline};
use crate::cpu;
use crate::process::Process;
use crate::stack::{self, KernelStack};
use crate::thread::{Thread, ThreadKind, ThreadState};

static THREAD_IDS: ThreadIdAllocator = ThreadIdAllocator::new();

/// Interrupt priority class the preemption timer requests its vector from.
/// High enough that device interrupts aren't starved by it, low enough
/// that it isn't itself starved by them.
const PREEMPT_PRIORITY: u8 = 8;

static PREEMPT_VECTOR: AtomicU64 = AtomicU64::new(0);

/// Hook into `kestrel-kernel`'s TSS, programmed with `next`'s kernel-stack
/// top on every switch so a ring-3 trap lands on the right stack. `None`
/// until the owning crate installs one during bring-up.
static SET_TSS_RSP0: AtomicU64 = AtomicU64::new(0);

/// Installs the function `sched_switch` calls to program `RSP0` in the
/// running CPU's TSS. `kestrel-sched` has no GDT/TSS of its own — that
/// bring-up lives in `kestrel-kernel` — so it is told how to reach it.
pub fn set_tss_rsp0_hook(hook: fn(u64)) {
    SET_TSS_RSP0.store(hook as usize as u64, Ordering::Release);
}

fn call_tss_rsp0_hook(rsp0: u64) {
    let hook = SET_TSS_RSP0.load(Ordering::Acquire);
    if hook != 0 {
        // SAFETY: only ever stored from `set_tss_rsp0_hook` with a value
        // cast from `fn(u64)`.
        let hook: fn(u64) = unsafe { core::mem::transmute(hook as usize) };
        hook(rsp0);
    }
}

fn alloc_thread(process: Option<Arc<Process>>, kind: ThreadKind, kernel_stack: KernelStack) -> *mut Thread {
    let id = THREAD_IDS.alloc();
    let thread = Box::new(Thread::new(id, process, kind, kernel_stack));
    Box::into_raw(thread)
}

/// Creates a ready kernel thread running `entry` and enqueues it on the
/// running CPU.
pub fn arch_sched_thread_create_kernel(entry: extern "C" fn() -> !) -> *mut Thread {
    let stack = stack::alloc_kernel_stack(thread_trampoline);
    let thread = alloc_thread(None, ThreadKind::Kernel { entry }, stack);
    cpu::current().enqueue(thread);
    thread
}

/// Creates a ready user thread resuming at `ip` with user stack pointer
/// `sp`, attached to `process`, and enqueues it on the running CPU.
pub fn arch_sched_thread_create_user(process: Arc<Process>, ip: u64, sp: u64) -> *mut Thread {
    let stack = stack::alloc_user_kernel_stack(thread_trampoline);
    let id_process = process.clone();
    let thread = alloc_thread(Some(process), ThreadKind::User { entry: ip, user_stack: sp }, stack);
    // SAFETY: `thread` was just allocated above and not yet published to
    // any other CPU.
    id_process.add_thread(unsafe { (*thread).id });
    cpu::current().enqueue(thread);
    thread
}

/// Builds a user thread's initial stack image in already-mapped anonymous
/// pages and returns the resulting stack pointer.
///
/// `virt_top` is the stack's user-visible top address; `phys_base` is the
/// physical frame backing its bottom, reached here through the HHDM so the
/// write never needs the process's page tables loaded.
#[allow(clippy::too_many_arguments)]
pub fn arch_sched_stack_setup(
    virt_top: VirtAddr,
    phys_base: PhysAddr,
    pages: usize,
    argv: &[&[u8]],
    envp: &[&[u8]],
    entry: u64,
    phdr: u64,
    phent: u64,
    phnum: u64,
) -> VirtAddr {
    let len = pages * kestrel_mm::PAGE_SIZE;
    let base = kestrel_mm::hhdm::phys_to_virt(phys_base);
    // SAFETY: `phys_base..phys_base+len` was just allocated and mapped by
    // the caller for exclusive use as this thread's user stack.
    let buf = unsafe { core::slice::from_raw_parts_mut(base.as_mut_ptr::<u8>(), len) };
    auxv::build(buf, virt_top, argv, envp, entry, phdr, phent, phnum)
}

/// Marks `thread` for teardown. It is reclaimed the next time it is
/// switched away from, per [`thread_drop`].
///
/// # Safety
///
/// `thread` must be a live pointer handed out by one of the
/// `arch_sched_thread_create_*` functions, not already destroyed.
pub unsafe fn arch_sched_thread_destroy(thread: *mut Thread) {
    // SAFETY: caller's contract.
    unsafe { (*thread).set_state(ThreadState::Exited) };
}

/// Returns the thread currently running on this CPU.
pub fn arch_sched_thread_current() -> *mut Thread {
    percpu::current_cpu().current_thread().cast()
}

/// Dequeues the next ready thread, if any.
pub fn thread_next() -> Option<*mut Thread> {
    cpu::current().dequeue()
}

/// Appends `thread` to the running CPU's ready queue. Exposed for
/// [`crate::sync`]'s wakers, which run on whichever CPU happens to call
/// them rather than necessarily the thread's own.
pub fn cpu_enqueue(thread: *mut Thread) {
    cpu::current().enqueue(thread);
}

/// Finalizes the thread just switched away from: re-enqueues it if still
/// READY, or reclaims its resources if it exited.
///
/// # Safety
///
/// `thread` must be a valid, uniquely-owned pointer produced by one of the
/// `arch_sched_thread_create_*` functions, not concurrently accessed by
/// any other CPU.
pub unsafe fn thread_drop(thread: *mut Thread) {
    if thread.is_null() {
        return;
    }
    // SAFETY: caller's contract; no other CPU observes `thread` while it
    // is mid-switch.
    let state = unsafe { (*thread).state() };
    match state {
        ThreadState::Exited => {
            // SAFETY: reclaiming ownership of the `Box` leaked in
            // `alloc_thread`; nothing else references `thread` past this
            // point.
            let boxed = unsafe { Box::from_raw(thread) };
            if let Some(process) = &boxed.process {
                process.remove_thread(boxed.id);
            }
            drop(boxed);
        }
        ThreadState::Running | ThreadState::Ready => {
            // SAFETY: see above.
            unsafe { (*thread).set_state(ThreadState::Ready) };
            cpu::current().enqueue(thread);
        }
        ThreadState::Blocked => {
            // Parked by a sleeping primitive; whoever unblocks it will
            // re-enqueue it themselves.
        }
    }
}

/// Called from [`context::thread_trampoline`] on every thread's first
/// switch-in: finalizes `prev` and re-arms the preemption timer.
pub(crate) fn common_thread_init(prev: *mut Thread) {
    // SAFETY: `prev` was the thread just switched away from by
    // `sched_switch`; it is not running anywhere else.
    unsafe { thread_drop(prev) };
    rearm_timer();
}

fn rearm_timer() {
    let vector = PREEMPT_VECTOR.load(Ordering::Relaxed) as u8;
    kestrel_interrupts::lapic::timer_oneshot(vector, config::TIMER_QUANTUM_TICKS);
}

fn preempt_isr(_vector: u8) {
    sched_next();
}

/// Switches to the next ready thread, falling back to the running CPU's
/// idle thread if the queue is empty; re-arms the preemption timer either
/// way.
pub fn sched_next() {
    let current = arch_sched_thread_current();
    let next = thread_next().unwrap_or_else(|| percpu::current_cpu().idle_thread().cast());

    if core::ptr::eq(current, next) {
        rearm_timer();
        return;
    }

    // SAFETY: both pointers name live threads: `current` is whatever is
    // installed as this CPU's running thread, `next` came from this CPU's
    // ready queue or its idle-thread slot.
    unsafe {
        switch_to(current, next);
    }
}

/// Performs the full six-step switch described for `sched_switch`:
/// address space, current-thread pointer, TSS `RSP0`, user segment bases,
/// FPU state, and finally the register/stack swap itself.
///
/// # Safety
///
/// `current` and `next` must be valid, non-aliasing `Thread` pointers;
/// `next` must not be running on another CPU.
pub(crate) unsafe fn switch_to(current: *mut Thread, next: *mut Thread) {
    // SAFETY: caller's contract.
    let (next_ref, current_ref) = unsafe { (&*next, &*current) };

    load_address_space(next_ref);

    percpu::current_cpu().set_current_thread(next.cast());
    call_tss_rsp0_hook(next_ref.kernel_stack.top_addr().as_u64());

    save_fpu(current_ref);
    restore_fpu(next_ref);

    // SAFETY: `current`/`next` satisfy `sched_switch`'s contract per this
    // function's own.
    unsafe { context::sched_switch(current, next) };
}

/// Loads `next`'s address space (its process's, or the kernel's global one
/// for a kernel thread) into CR3, skipping the write if it's already the
/// one loaded on this CPU.
fn load_address_space(next: &Thread) {
    let target = next
        .process
        .as_ref()
        .map(|process| process.root_phys().as_u64())
        .unwrap_or_else(percpu::global_root_phys);

    let cpu = percpu::current_cpu();
    if cpu.loaded_address_space() != target {
        // SAFETY: `target` is either `next.process`'s own root, kept alive
        // by the `Arc` `next` holds, or the kernel's global root recorded
        // once at boot — both valid, resident PML4 tables.
        unsafe {
            kestrel_core::arch::x86_64::registers::control::Cr3::write(kestrel_core::addr::PhysAddr::new(target));
        }
        cpu.set_loaded_address_space(target);
    }
}

fn save_fpu(thread: &Thread) {
    let ptr = thread.fpu.0.as_ptr();
    // SAFETY: `ptr` is 16-byte aligned (in fact 64-byte, see `FpuState`)
    // and `fxsave`'s 512-byte image fits within `FpuState`'s buffer.
    unsafe { core::arch::asm!("fxsave [{}]", in(reg) ptr, options(nostack)) };
}

fn restore_fpu(thread: &Thread) {
    let ptr = thread.fpu.0.as_ptr();
    // SAFETY: see `save_fpu`; the buffer holds either a prior `fxsave`
    // image or the zeroed initial state, both valid `fxrstor` inputs.
    unsafe { core::arch::asm!("fxrstor [{}]", in(reg) ptr, options(nostack)) };
}

extern "C" fn idle_loop() -> ! {
    loop {
        // SAFETY: idle threads run with interrupts enabled so the
        // preemption timer and device interrupts can reach them.
        unsafe { kestrel_core::arch::x86_64::instructions::interrupts::enable_and_hlt() };
    }
}

static BRINGUP_BARRIER: AtomicU64 = AtomicU64::new(0);
static BRINGUP_RELEASED: AtomicBool = AtomicBool::new(false);

/// Releases every CPU waiting in [`init_cpu`]. Called once by the
/// bootstrap processor after it has finished its own `init_cpu`.
pub fn release_bringup_barrier() {
    BRINGUP_RELEASED.store(true, Ordering::Release);
}

/// Brings up scheduling on the running CPU: creates its idle thread,
/// parks the current execution context as a transient bootstrap thread,
/// requests the preemption vector (once, on the bootstrap processor), and
/// switches into the idle thread. The bootstrap thread's stack is
/// reclaimed by the idle thread's first [`thread_drop`].
pub fn init_cpu(cpu_id: CpuId) {
    if cpu_id == CpuId::BSP {
        let vector = kestrel_interrupts::request(PREEMPT_PRIORITY, preempt_isr).expect("preemption vector exhausted");
        PREEMPT_VECTOR.store(u64::from(vector), Ordering::Relaxed);
        release_bringup_barrier();
    } else {
        BRINGUP_BARRIER.fetch_add(1, Ordering::AcqRel);
        while !BRINGUP_RELEASED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    let idle_stack = stack::alloc_kernel_stack(thread_trampoline);
    let idle = Box::into_raw(Box::new(Thread::new(ThreadId::IDLE, None, ThreadKind::Kernel { entry: idle_loop }, idle_stack)));
    percpu::current_cpu().set_idle_thread(idle.cast());

    let bootstrap_stack = stack::alloc_kernel_stack(thread_trampoline);
    let bootstrap = alloc_thread(None, ThreadKind::Kernel { entry: idle_loop }, bootstrap_stack);
    // SAFETY: freshly allocated, not yet published anywhere else.
    unsafe { (*bootstrap).set_state(ThreadState::Exited) };
    percpu::current_cpu().set_current_thread(bootstrap.cast());

    // SAFETY: `bootstrap` and `idle` are both live, CPU-local threads;
    // `idle` has never run and its seeded stack lands in
    // `thread_trampoline`.
    unsafe { switch_to(bootstrap, idle) };
}
