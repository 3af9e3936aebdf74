//! Kernel entry point.
//!
//! [`BootInfo`] is a narrow collaborator interface: whatever boot protocol
//! gets the kernel loaded (Limine and its peers all look like this)
//! implements it once, and everything downstream of [`kernel_init`] only
//! ever sees a memory map, an HHDM offset, and a LAPIC/secondary-CPU
//! descriptor — never a bootloader type directly. ACPI/MADT parsing that
//! produces these values is the boot protocol's problem, not this crate's.

extern crate alloc;

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::arch::x86_64::registers::control::Cr3;
use kestrel_core::id::CpuId;
use kestrel_core::kinfo;
use kestrel_interrupts::lapic::LocalApic;
use kestrel_mm::pmm;
use kestrel_mm::{PhysMemoryRegion, ZoneKind};

use crate::{arch, config, log};

/// One secondary (non-bootstrap) CPU the boot protocol discovered.
pub struct SecondaryCpu {
    /// This CPU's local APIC id.
    pub lapic_id: u8,
    /// Starts this CPU executing `entry(arg)` in 64-bit long mode, its own
    /// stack and page tables already set up by the boot protocol.
    ///
    /// # Safety
    ///
    /// May be called at most once per [`SecondaryCpu`], with `entry` a
    /// valid, non-returning function matching the boot protocol's AP entry
    /// ABI.
    pub start: unsafe fn(entry: extern "C" fn(u64) -> !, arg: u64),
}

/// What [`kernel_init`] needs from the boot protocol.
pub trait BootInfo {
    /// Offset at which all physical memory is mapped (the HHDM).
    fn hhdm_offset(&self) -> u64;
    /// Highest physical address byte the memory map reports, rounded up
    /// to a page; sizes the HHDM and the kernel's virtual layout.
    fn max_phys_addr(&self) -> u64;
    /// Physical memory regions, in any order. Overlapping a reserved
    /// range is the region's problem, not the caller's — [`pmm::region_add`]
    /// only claims memory actually inside a registered zone.
    fn memory_regions(&self) -> &[PhysMemoryRegion];
    /// Physical base of the bootstrap processor's local APIC MMIO window.
    fn lapic_phys_addr(&self) -> PhysAddr;
    /// Every non-bootstrap CPU the boot protocol discovered.
    fn secondary_cpus(&self) -> &[SecondaryCpu];
}

/// Legacy DMA controllers can only address the first 16 MiB of physical
/// memory; everything above that lands in the `NORMAL` zone.
const DMA_CEILING: u64 = 16 * 1024 * 1024;

static LAPIC_VIRT: AtomicU64 = AtomicU64::new(0);

/// Returns the permanent virtual mapping of the running machine's LAPIC,
/// established once during [`kernel_init`]. Every CPU's own hardware LAPIC
/// lives at this address from its own point of view.
pub fn lapic_virt_addr() -> VirtAddr {
    VirtAddr::new(LAPIC_VIRT.load(Ordering::Acquire))
}

fn tss_rsp0_hook(rsp: u64) {
    // SAFETY: the scheduler only calls this mid-switch, with interrupts
    // disabled, after `arch::cpu_init` has run on this CPU.
    unsafe { arch::x86_64::gdt::set_tss_rsp0(rsp) };
}

/// Brings up the kernel from a freshly loaded boot protocol: CPU/GDT/IDT,
/// physical and virtual memory, logging, the LAPIC, secondary CPUs, and
/// finally the scheduler. Never returns — control passes to the bootstrap
/// processor's idle thread.
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    // SAFETY: the very first thing the bootstrap processor does; no other
    // CPU and no interrupt source is active yet.
    unsafe { log::init_early() };
    kinfo!("kestrel-kernel {} starting", config::VERSION);

    // SAFETY: runs once, before anything reads `current_cpu()`.
    unsafe { kestrel_core::percpu::init_bsp() };
    // SAFETY: GS base is already programmed; interrupts are still off.
    unsafe { arch::cpu_init(CpuId::BSP) };

    kestrel_mm::hhdm::init(boot_info.hhdm_offset());

    pmm::zone_register(ZoneKind::Dma, "dma", PhysAddr::zero(), PhysAddr::new(DMA_CEILING));
    pmm::zone_register(
        ZoneKind::Normal,
        "normal",
        PhysAddr::new(DMA_CEILING),
        PhysAddr::new(boot_info.max_phys_addr()),
    );
    for region in boot_info.memory_regions() {
        if region.usable {
            // SAFETY: the boot protocol reports this range as usable RAM,
            // not otherwise claimed, and HHDM-accessible once `hhdm::init`
            // above has run.
            let _ = unsafe { pmm::region_add(region.start, region.size) };
        }
    }
    kinfo!("pmm: zones registered, regions populated");

    let root_phys = Cr3::read();
    kestrel_core::percpu::set_global_root_phys(root_phys.as_u64());
    crate::mm::init(root_phys, boot_info.hhdm_offset(), boot_info.max_phys_addr());

    let (heap_base, heap_size) = crate::mm::map_initial_heap();
    // SAFETY: `[heap_base, heap_base + heap_size)` was just mapped and
    // zeroed by `map_initial_heap`.
    unsafe { kestrel_mm::heap::init(heap_base.as_u64() as usize, heap_size as usize) };
    kestrel_mm::heap::register_grow_fn(crate::mm::grow_heap);

    log::init();
    kinfo!("heap online: {} KiB at {:#x}", heap_size / 1024, heap_base.as_u64());

    let lapic_virt_mapped = crate::mm::map_mmio_region(boot_info.lapic_phys_addr(), 0x1000);
    LAPIC_VIRT.store(lapic_virt_mapped.as_u64(), Ordering::Release);

    let lapic = unsafe { LocalApic::new(lapic_virt_addr()) };
    lapic.enable(kestrel_interrupts::idt::SPURIOUS_VECTOR);
    // SAFETY: `lapic` wraps the bootstrap processor's own LAPIC MMIO window,
    // just mapped above.
    unsafe { kestrel_interrupts::lapic::init(lapic) };
    kinfo!("lapic: enabled on bootstrap processor");

    kestrel_sched::set_tss_rsp0_hook(tss_rsp0_hook);

    // SAFETY: the bootstrap processor's LAPIC is enabled.
    unsafe { arch::x86_64::tlb::init() };

    // SAFETY: safe to call from exception context; only reads the VMM layout.
    unsafe { kestrel_interrupts::exceptions::set_fault_region_fn(crate::mm::fault_region_name) };

    // SAFETY: memory, the IDT, and the LAPIC are fully up; no secondary
    // CPU has been started yet.
    unsafe { arch::x86_64::smp::boot_aps(boot_info) };

    demo_threads();

    // Never returns: builds the idle thread and switches into it.
    kestrel_sched::init_cpu(CpuId::BSP)
}

extern "C" fn demo_thread_entry() -> ! {
    loop {
        kinfo!("demo thread alive on cpu {}", kestrel_core::percpu::current_cpu().cpu_id().as_u32());
        for _ in 0..50_000_000u64 {
            core::hint::spin_loop();
        }
    }
}

/// Spawns a couple of kernel threads so the scheduler has visible work to
/// preempt between. Stands in for whatever real workloads a full build
/// would launch from an init process.
fn demo_threads() {
    kestrel_sched::arch_sched_thread_create_kernel(demo_thread_entry);
    kestrel_sched::arch_sched_thread_create_kernel(demo_thread_entry);
}
