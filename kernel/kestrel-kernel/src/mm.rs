//! Kernel-side virtual memory manager glue.
//!
//! [`kestrel_mm::vmm::Vmm`] is generic and holds no global state of its own;
//! `kernel_init` builds exactly one instance for the kernel's own address
//! space and stashes it here so the heap allocator's growth callback and
//! MMIO mapping requests have somewhere to reach it from outside
//! `kernel_init`'s local scope.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::sync::SpinLock;
use kestrel_mm::arch::x86_64::PageTableMapper;
use kestrel_mm::pmm::PmmFrameAllocRef;
use kestrel_mm::vmm::Vmm;

/// The kernel's own VMM, parameterised on this architecture's page mapper.
pub type KernelVmm = Vmm<PageTableMapper>;

static VMM: SpinLock<Option<KernelVmm>> = SpinLock::new(None);

/// Builds the kernel VMM over `root_phys` and installs it globally.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(root_phys: PhysAddr, hhdm_offset: u64, max_phys: u64) {
    let mapper = PageTableMapper::new(hhdm_offset);
    let vmm = KernelVmm::new(root_phys, mapper, hhdm_offset, max_phys);

    let mut global = VMM.lock();
    assert!(global.is_none(), "kernel vmm already initialized");
    *global = Some(vmm);
}

/// Runs `f` with the global kernel VMM.
///
/// # Panics
///
/// Panics if [`init`] has not run yet.
pub fn with_vmm<R>(f: impl FnOnce(&mut KernelVmm) -> R) -> R {
    let mut vmm = VMM.lock();
    f(vmm.as_mut().expect("kernel vmm not initialized"))
}

/// Maps the initial kernel heap region and returns `(base, size)`.
pub fn map_initial_heap() -> (VirtAddr, u64) {
    with_vmm(|vmm| {
        let mut alloc = PmmFrameAllocRef::new();
        vmm.map_initial_heap(&mut alloc).expect("failed to map initial kernel heap")
    })
}

/// Grows the kernel heap by at least `min_bytes`.
///
/// Registered with [`kestrel_mm::heap::register_grow_fn`] so an allocation
/// that finds the heap exhausted requests more pages instead of failing
/// outright.
pub fn grow_heap(min_bytes: usize) -> Option<(*mut u8, usize)> {
    let mut vmm = VMM.lock();
    let vmm = vmm.as_mut()?;
    let mut alloc = PmmFrameAllocRef::new();
    let (base, size) = vmm.grow_heap(min_bytes as u64, &mut alloc).ok()?;
    Some((base.as_mut_ptr::<u8>(), size as usize))
}

/// Maps an MMIO physical region into kernel virtual space, permanently.
pub fn map_mmio_region(phys: PhysAddr, size: u64) -> VirtAddr {
    with_vmm(|vmm| {
        let mut alloc = PmmFrameAllocRef::dma();
        let mapping = vmm.map_mmio(phys, size, &mut alloc, None).expect("failed to map MMIO region");
        mapping.virt_base()
    })
}

/// Names the kernel virtual region `addr` falls into, for page-fault crash
/// reports. Registered with [`kestrel_interrupts::exceptions::set_fault_region_fn`].
///
/// Uses [`SpinLock::try_lock`] rather than blocking: a page fault can land
/// while this CPU already holds the VMM lock (e.g. mid heap-grow), and the
/// reporter that calls this never returns, so deadlocking instead of
/// printing "unknown" would only lose diagnostic detail, not correctness.
pub fn fault_region_name(addr: u64) -> &'static str {
    let Some(vmm) = VMM.try_lock() else {
        return "unknown";
    };
    let Some(vmm) = vmm.as_ref() else {
        return "unknown";
    };
    vmm.layout().identify_region(VirtAddr::new(addr)).name()
}
