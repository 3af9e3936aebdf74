//! Per-CPU state foundation (SMP-ready).
//!
//! Provides a per-CPU data structure that holds CPU-local state needed by
//! interrupt entry and the scheduler: the kernel stack pointer, the APIC
//! id, and opaque handles to the running and idle threads. Each CPU
//! accesses its own instance via a `GS:[0]` self-pointer; the BSP uses a
//! static instance, APs allocate theirs during bring-up.
//!
//! This module knows nothing about thread or run-queue layout. The
//! scheduler installs its own per-CPU structure through
//! [`PerCpu::set_scheduler_data`] and casts it back on retrieval.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::id::CpuId;

/// Size of the stack used for interrupt entry before the scheduler has
/// allocated a proper guarded kernel stack for this CPU.
const EARLY_BOOT_STACK_SIZE: usize = 16384;

#[repr(align(16))]
struct AlignedStack(
    #[allow(dead_code, reason = "backing storage accessed by assembly")]
    [u8; EARLY_BOOT_STACK_SIZE],
);

/// Per-CPU boot stack for the BSP. APs are given their own stack during
/// bring-up before their GS base is programmed.
static mut BSP_BOOT_STACK: AlignedStack = AlignedStack([0; EARLY_BOOT_STACK_SIZE]);

/// Per-CPU data structure.
///
/// `#[repr(C)]` gives deterministic field offsets for the asm that reads
/// `GS:[0]` in `current_cpu()` and in the interrupt entry stubs:
/// - offset  0: `self_ptr`
/// - offset  8: `kernel_rsp`
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer for the `GS:[0]` access pattern.
    ///
    /// Set once during this CPU's init to its own address, so
    /// `current_cpu()` can find the struct without a global lookup table.
    pub self_ptr: u64,
    /// Kernel stack pointer loaded into the TSS `RSP0` slot, used when an
    /// interrupt or syscall is taken from ring 3.
    pub kernel_rsp: u64,
    /// Opaque pointer to the thread control block currently running on
    /// this CPU. Updated by the scheduler on every context switch; read
    /// by the page-fault handler and other trap code that needs to
    /// attribute a fault to a thread.
    current_thread: AtomicU64,
    /// Opaque pointer to this CPU's idle thread, set once at bring-up.
    idle_thread: AtomicU64,
    /// Opaque pointer to the scheduler's own per-CPU run-queue structure.
    /// `kestrel-core` never dereferences this; it exists so the scheduler
    /// can reach its state from `current_cpu()` without `kestrel-core`
    /// depending on the scheduler crate.
    scheduler_data: AtomicU64,
    /// Generation counter bumped by this CPU's TLB-shootdown IPI handler.
    /// An initiator polls every target CPU's counter to know when a
    /// shootdown round has been observed everywhere.
    tlb_shootdown_generation: AtomicU64,
    /// Pending-invalidation virtual address, written by the shootdown
    /// initiator before sending the IPI and read by this CPU's own
    /// handler.
    tlb_shootdown_addr: AtomicU64,
    /// Physical address of the address-space root currently loaded into
    /// this CPU's CR3, or `u64::MAX` (never a valid, page-aligned frame
    /// address) before the first load. Lets the scheduler skip redundant
    /// `CR3` writes when consecutive threads share an address space.
    loaded_address_space: AtomicU64,
    /// Logical CPU id (0 for the bootstrap processor).
    cpu_id: AtomicU32,
    /// Local APIC id.
    apic_id: AtomicU8,
    /// Whether this instance has completed [`PerCpu::init`].
    initialized: AtomicBool,
}

impl PerCpu {
    /// Creates a new uninitialized `PerCpu`.
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            current_thread: AtomicU64::new(0),
            idle_thread: AtomicU64::new(0),
            scheduler_data: AtomicU64::new(0),
            tlb_shootdown_generation: AtomicU64::new(0),
            tlb_shootdown_addr: AtomicU64::new(0),
            loaded_address_space: AtomicU64::new(u64::MAX),
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Records this CPU's id and APIC id and marks it initialized.
    pub fn init(&self, cpu_id: CpuId, apic_id: u8) {
        self.cpu_id.store(cpu_id.as_u32(), Ordering::Relaxed);
        self.apic_id.store(apic_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Returns this CPU's logical id.
    pub fn cpu_id(&self) -> CpuId {
        CpuId::new(self.cpu_id.load(Ordering::Relaxed))
    }

    /// Returns this CPU's local APIC id.
    pub fn apic_id(&self) -> u8 {
        self.apic_id.load(Ordering::Relaxed)
    }

    /// Returns whether [`PerCpu::init`] has run for this instance.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns the opaque pointer to the currently running thread, or
    /// null before the scheduler has taken over this CPU.
    pub fn current_thread(&self) -> *mut () {
        self.current_thread.load(Ordering::Acquire) as *mut ()
    }

    /// Records the thread now running on this CPU. Called by the
    /// scheduler on every switch.
    pub fn set_current_thread(&self, thread: *mut ()) {
        self.current_thread.store(thread as u64, Ordering::Release);
    }

    /// Returns the opaque pointer to this CPU's idle thread.
    pub fn idle_thread(&self) -> *mut () {
        self.idle_thread.load(Ordering::Acquire) as *mut ()
    }

    /// Records this CPU's idle thread. Called once during scheduler
    /// bring-up for this CPU.
    pub fn set_idle_thread(&self, thread: *mut ()) {
        self.idle_thread.store(thread as u64, Ordering::Release);
    }

    /// Returns the opaque pointer to the scheduler's per-CPU structure,
    /// or null if the scheduler has not installed one yet.
    pub fn scheduler_data(&self) -> *mut () {
        self.scheduler_data.load(Ordering::Acquire) as *mut ()
    }

    /// Installs the scheduler's per-CPU structure for this CPU.
    pub fn set_scheduler_data(&self, data: *mut ()) {
        self.scheduler_data.store(data as u64, Ordering::Release);
    }

    /// Returns this CPU's current TLB-shootdown generation.
    pub fn tlb_shootdown_generation(&self) -> u64 {
        self.tlb_shootdown_generation.load(Ordering::Acquire)
    }

    /// Bumps this CPU's TLB-shootdown generation. Called from the
    /// shootdown IPI handler after the local invalidation completes.
    pub fn bump_tlb_shootdown_generation(&self) {
        self.tlb_shootdown_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the virtual address the shootdown initiator last asked this
    /// CPU to invalidate.
    pub fn tlb_shootdown_addr(&self) -> u64 {
        self.tlb_shootdown_addr.load(Ordering::Acquire)
    }

    /// Records the virtual address for this CPU's next shootdown IPI to
    /// invalidate. Must be stored before the IPI is sent.
    pub fn set_tlb_shootdown_addr(&self, addr: u64) {
        self.tlb_shootdown_addr.store(addr, Ordering::Release);
    }

    /// Returns the physical address of the address-space root currently
    /// loaded into this CPU's CR3, or `u64::MAX` if none has been loaded
    /// yet.
    pub fn loaded_address_space(&self) -> u64 {
        self.loaded_address_space.load(Ordering::Acquire)
    }

    /// Records the physical address of the address-space root just loaded
    /// into this CPU's CR3. Called by the scheduler after every `CR3`
    /// write.
    pub fn set_loaded_address_space(&self, root: u64) {
        self.loaded_address_space.store(root, Ordering::Release);
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// BSP per-CPU data (single static instance for the bootstrap processor).
static mut BSP_PERCPU: PerCpu = PerCpu::new();

/// Number of CPUs currently online.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Returns the number of CPUs currently online.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Physical root of the kernel's own address space (the one every thread
/// with no process runs in), set once during boot.
static GLOBAL_ROOT_PHYS: AtomicU64 = AtomicU64::new(0);

/// Records the kernel's address-space root. Must be called once, before
/// the first thread switch on any CPU.
pub fn set_global_root_phys(root: u64) {
    GLOBAL_ROOT_PHYS.store(root, Ordering::Release);
}

/// Returns the kernel's address-space root, as recorded by
/// [`set_global_root_phys`].
pub fn global_root_phys() -> u64 {
    GLOBAL_ROOT_PHYS.load(Ordering::Acquire)
}

const ZERO_REGISTRY_SLOT: AtomicU64 = AtomicU64::new(0);

/// Registry of every online CPU's [`PerCpu`] address, indexed by [`CpuId`].
/// Populated by each CPU via [`register`] during its own bring-up.
static PERCPU_REGISTRY: CpuLocal<AtomicU64> = CpuLocal::new([ZERO_REGISTRY_SLOT; MAX_CPUS]);

/// Registers `cpu` so [`for_each_online`] can reach it. Called once per CPU,
/// after [`PerCpu::init`] has set its id.
pub fn register(cpu_id: CpuId, cpu: &'static PerCpu) {
    PERCPU_REGISTRY.get_for(cpu_id).store(core::ptr::from_ref(cpu) as u64, Ordering::Release);
}

/// Calls `f` with every CPU that has completed [`register`], including
/// the caller's own.
pub fn for_each_online(mut f: impl FnMut(CpuId, &'static PerCpu)) {
    for i in 0..cpu_count() as usize {
        let cpu_id = CpuId::new(i as u32);
        let ptr = PERCPU_REGISTRY.get_for(cpu_id).load(Ordering::Acquire);
        if ptr != 0 {
            // SAFETY: only non-null pointers stored by `register`, which
            // requires a `&'static PerCpu` outliving the kernel.
            let cpu = unsafe { &*(ptr as *const PerCpu) };
            f(cpu_id, cpu);
        }
    }
}

/// Records the number of CPUs currently online. Called once SMP bring-up
/// has started every application processor.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::Release);
}

/// Returns a reference to the current CPU's per-CPU data.
///
/// Reads the self-pointer from `GS:[0]`, set during this CPU's GS-base
/// init.
#[cfg(target_arch = "x86_64")]
pub fn current_cpu() -> &'static PerCpu {
    let ptr: u64;
    // SAFETY: GS:[0] holds the self_ptr field written by init_bsp/AP
    // bring-up for this CPU; the read is lock-free and valid for the
    // lifetime of the CPU.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// Initializes `GS_BASE`/`KERNEL_GS_BASE` to point at the bootstrap
/// processor's [`PerCpu`] and seeds its early boot stack.
///
/// # Safety
///
/// Must be called exactly once, after the GDT/TSS are loaded and before
/// any interrupt that relies on `current_cpu()` can fire.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_bsp() {
    use crate::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let percpu_addr = core::ptr::addr_of!(BSP_PERCPU) as u64;
    let stack_top = core::ptr::addr_of!(BSP_BOOT_STACK) as u64 + EARLY_BOOT_STACK_SIZE as u64;

    // SAFETY: BSP_PERCPU and BSP_BOOT_STACK are module-level statics, only
    // written here before any other CPU or interrupt handler can observe
    // them, per the caller's contract.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).self_ptr = percpu_addr;
        (*percpu_ptr).kernel_rsp = stack_top;
        (*percpu_ptr).init(CpuId::BSP, 0);

        IA32_GS_BASE.write(percpu_addr);
        IA32_KERNEL_GS_BASE.write(percpu_addr);

        register(CpuId::BSP, &*core::ptr::addr_of!(BSP_PERCPU));
    }

    crate::kdebug!(
        "percpu: bsp gs base initialized, percpu={:#x} kernel_rsp={:#x}",
        percpu_addr,
        stack_top
    );
}

/// Upper bound on the number of CPUs this build supports.
///
/// Sized for a generously large SMP box; `kestrel-core` does not allocate,
/// so raising this only costs static storage in [`CpuLocal`] tables.
pub const MAX_CPUS: usize = 64;

/// CPU-local storage. Wraps `[T; MAX_CPUS]`, indexed by CPU id.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    #[cfg(target_arch = "x86_64")]
    pub fn get(&self) -> &T {
        &self.data[current_cpu().cpu_id().as_usize()]
    }

    /// Host-only fallback: always returns CPU 0's instance.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn get(&self) -> &T {
        &self.data[0]
    }

    /// Returns a reference to a specific CPU's instance.
    pub fn get_for(&self, cpu_id: CpuId) -> &T {
        &self.data[cpu_id.as_usize()]
    }
}

// SAFETY: each CPU only mutates the slot it indexes with its own id.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percpu_starts_uninitialized() {
        let cpu = PerCpu::new();
        assert!(!cpu.is_initialized());
        assert_eq!(cpu.cpu_id(), CpuId::BSP);
        assert!(cpu.current_thread().is_null());
        assert!(cpu.idle_thread().is_null());
    }

    #[test]
    fn percpu_init_marks_ready() {
        let cpu = PerCpu::new();
        cpu.init(CpuId::new(3), 7);
        assert!(cpu.is_initialized());
        assert_eq!(cpu.cpu_id(), CpuId::new(3));
        assert_eq!(cpu.apic_id(), 7);
    }

    #[test]
    fn thread_handles_round_trip() {
        let cpu = PerCpu::new();
        let mut marker = 0u8;
        let ptr = core::ptr::addr_of_mut!(marker).cast::<()>();
        cpu.set_current_thread(ptr);
        cpu.set_idle_thread(ptr);
        assert_eq!(cpu.current_thread(), ptr);
        assert_eq!(cpu.idle_thread(), ptr);
    }

    #[test]
    fn tlb_shootdown_generation_increments() {
        let cpu = PerCpu::new();
        assert_eq!(cpu.tlb_shootdown_generation(), 0);
        cpu.bump_tlb_shootdown_generation();
        cpu.bump_tlb_shootdown_generation();
        assert_eq!(cpu.tlb_shootdown_generation(), 2);
    }
}
