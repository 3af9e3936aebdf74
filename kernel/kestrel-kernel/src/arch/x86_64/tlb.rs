//! Cross-CPU TLB shootdown.
//!
//! Wires `kestrel_mm::vmspace`'s address-space-aware unmap to a LAPIC IPI
//! broadcast: when a leaf mapping is torn down, every other online CPU with
//! that address space loaded gets asked to invalidate the stale entry, and
//! the unmapping CPU waits for each to acknowledge before returning. Kept
//! here rather than in `kestrel-mm` so that crate never needs to depend on
//! interrupt dispatch — see [`kestrel_mm::vmspace::set_tlb_shootdown_hook`].

use core::sync::atomic::{AtomicU8, Ordering};

use kestrel_core::percpu::{self, PerCpu};
use kestrel_interrupts::lapic::IpiFlags;

/// Priority class for the shootdown IPI. Placed right after the exception
/// range since the initiator spins on every target's acknowledgment.
const SHOOTDOWN_PRIORITY: u8 = 2;

static SHOOTDOWN_VECTOR: AtomicU8 = AtomicU8::new(0);

/// Claims the shootdown IPI vector and installs this module's hook into
/// `kestrel_mm::vmspace`.
///
/// # Safety
///
/// Must run once, after this CPU's LAPIC is enabled.
pub unsafe fn init() {
    let vector =
        kestrel_interrupts::request(SHOOTDOWN_PRIORITY, handle_shootdown).expect("tlb shootdown vector exhausted");
    SHOOTDOWN_VECTOR.store(vector, Ordering::Relaxed);
    kestrel_mm::vmspace::set_tlb_shootdown_hook(shootdown);
}

fn handle_shootdown(_vector: u8) {
    let cpu = percpu::current_cpu();
    let addr = kestrel_core::addr::VirtAddr::new(cpu.tlb_shootdown_addr());
    kestrel_core::arch::x86_64::instructions::tlb::flush(addr);
    cpu.bump_tlb_shootdown_generation();
}

#[derive(Clone, Copy)]
struct Target {
    ptr: u64,
    apic_id: u8,
    gen_before: u64,
}

/// Invalidates `vaddr` on every other online CPU that currently has
/// `root_phys` loaded, and blocks until each has acknowledged.
///
/// Called from [`kestrel_mm::vmspace::VmSpace::unmap`] with interrupts
/// enabled on the unmapping CPU, never from inside an ISR.
fn shootdown(root_phys: u64, vaddr: u64) {
    let vector = SHOOTDOWN_VECTOR.load(Ordering::Relaxed);
    if vector == 0 {
        // Not wired up yet: still within the single-CPU boot window.
        return;
    }

    let here = percpu::current_cpu().cpu_id();
    let mut targets: [Option<Target>; percpu::MAX_CPUS] = [None; percpu::MAX_CPUS];
    let mut count = 0usize;

    percpu::for_each_online(|cpu_id, cpu| {
        if cpu_id != here && cpu.loaded_address_space() == root_phys {
            cpu.set_tlb_shootdown_addr(vaddr);
            targets[count] = Some(Target {
                ptr: core::ptr::from_ref(cpu) as u64,
                apic_id: cpu.apic_id(),
                gen_before: cpu.tlb_shootdown_generation(),
            });
            count += 1;
        }
    });

    for target in targets.iter().take(count).flatten() {
        // SAFETY: `target.apic_id` names a CPU just observed online with
        // `root_phys` loaded; `vector` is the fixed handler registered by
        // `init`.
        unsafe { kestrel_interrupts::lapic::ipi(target.apic_id, vector, IpiFlags::FIXED) };
    }

    for target in targets.iter().take(count).flatten() {
        // SAFETY: `target.ptr` is the address of a `&'static PerCpu` read
        // from the online-CPU registry above.
        let cpu = unsafe { &*(target.ptr as *const PerCpu) };
        while cpu.tlb_shootdown_generation() == target.gen_before {
            core::hint::spin_loop();
        }
    }
}
