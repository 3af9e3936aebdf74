//! Application-processor bring-up.
//!
//! Boot protocols that support SMP (Limine and its peers) hand back one
//! entry per secondary CPU carrying its LAPIC id and a way to start it:
//! pointing it at an entry function makes that CPU jump straight into
//! 64-bit long mode, paging already enabled and matching the bootstrap
//! processor's page tables. [`boot_aps`] is called once the kernel's
//! memory layout is final, so there's no window where a starting AP's
//! page tables could go stale underneath it — unlike the bootstrap
//! processor, which must survive its own page-table handoff.

extern crate alloc;

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;

use kestrel_core::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};
use kestrel_core::id::CpuId;
use kestrel_core::percpu::PerCpu;
use kestrel_core::{kinfo, kwarn};
use kestrel_interrupts::lapic::LocalApic;

use crate::boot::BootInfo;

static AP_READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// Starts every secondary CPU `boot_info` reports and waits (with a
/// timeout) for each to come online.
///
/// # Safety
///
/// Must run after the kernel's page tables, heap, and IDT are in their
/// final bring-up state: an AP starts executing [`ap_entry_trampoline`]
/// immediately and shares all of that state with the bootstrap processor.
pub unsafe fn boot_aps(boot_info: &impl BootInfo) {
    let secondaries = boot_info.secondary_cpus();
    if secondaries.is_empty() {
        kinfo!("smp: no secondary CPUs to bring up");
        return;
    }

    assert!(
        secondaries.len() < crate::config::MAX_CPUS,
        "boot protocol reports more CPUs than this build supports"
    );
    kinfo!("smp: starting {} secondary CPUs", secondaries.len());

    for (i, cpu) in secondaries.iter().enumerate() {
        let cpu_id = CpuId::new((i + 1) as u32);
        let percpu = Box::leak(Box::new(PerCpu::new()));
        let percpu_addr = core::ptr::from_mut(percpu) as u64;
        percpu.self_ptr = percpu_addr;
        percpu.init(cpu_id, cpu.lapic_id);

        // SAFETY: `percpu_addr` is leaked for the life of the kernel;
        // `cpu` names a real, unstarted secondary CPU per `boot_info`'s
        // contract.
        unsafe { (cpu.start)(ap_entry_trampoline, percpu_addr) };
    }

    let expected = secondaries.len() as u32;
    let mut spins = 0u64;
    const TIMEOUT: u64 = 100_000_000;
    while AP_READY_COUNT.load(Ordering::Acquire) < expected {
        core::hint::spin_loop();
        spins += 1;
        if spins >= TIMEOUT {
            kwarn!(
                "smp: timed out waiting for APs ({}/{} ready)",
                AP_READY_COUNT.load(Ordering::Acquire),
                expected
            );
            break;
        }
    }

    let ready = AP_READY_COUNT.load(Ordering::Acquire);
    kestrel_core::percpu::set_cpu_count(1 + ready);
    kinfo!("smp: {} secondary CPUs online ({} total)", ready, 1 + ready);
}

/// Entry point every secondary CPU starts executing in: 64-bit long mode,
/// its own stack already set up by the boot protocol. `percpu_addr` is the
/// leaked [`PerCpu`] address [`boot_aps`] stashed for it.
extern "C" fn ap_entry_trampoline(percpu_addr: u64) -> ! {
    // SAFETY: `percpu_addr` was written by `boot_aps` just before this CPU
    // was started and outlives the kernel.
    unsafe {
        IA32_GS_BASE.write(percpu_addr);
        IA32_KERNEL_GS_BASE.write(percpu_addr);
    }

    let cpu_id = kestrel_core::percpu::current_cpu().cpu_id();
    // SAFETY: `percpu_addr` is the leaked, 'static `PerCpu` written above.
    kestrel_core::percpu::register(cpu_id, unsafe { &*(percpu_addr as *const PerCpu) });

    // SAFETY: GS base above already points this CPU at its own PerCpu.
    unsafe { super::gdt::init(cpu_id) };
    // SAFETY: the IDT is a shared, already-built static; CS is valid.
    unsafe { kestrel_interrupts::idt::init(super::gdt::DOUBLE_FAULT_IST_INDEX) };

    let lapic_virt = crate::boot::lapic_virt_addr();
    // SAFETY: `lapic_virt` is the same permanent LAPIC MMIO mapping the
    // bootstrap processor uses; each CPU's own hardware LAPIC lives at
    // that address from its own point of view.
    let lapic = unsafe { LocalApic::new(lapic_virt) };
    lapic.enable(kestrel_interrupts::idt::SPURIOUS_VECTOR);
    // SAFETY: `lapic` wraps this CPU's own LAPIC MMIO window.
    unsafe { kestrel_interrupts::lapic::init(lapic) };

    AP_READY_COUNT.fetch_add(1, Ordering::Release);
    kinfo!("smp: cpu {} online (lapic id {})", cpu_id.as_u32(), kestrel_core::percpu::current_cpu().apic_id());

    // Never returns: creates this CPU's idle thread and switches into it,
    // enabling interrupts on the way.
    kestrel_sched::init_cpu(cpu_id);
}
