//! Architecture bring-up facade.

pub mod x86_64;

/// Brings up this CPU's GDT/TSS, IDT, and per-CPU GS base.
///
/// # Safety
///
/// Must run once per CPU, early: before interrupts are enabled and before
/// anything calls [`kestrel_core::percpu::current_cpu`] other than the
/// GDT/TSS build step itself (which reads the already-programmed GS
/// base).
pub unsafe fn cpu_init(cpu_id: kestrel_core::id::CpuId) {
    unsafe {
        x86_64::gdt::init(cpu_id);
        kestrel_interrupts::idt::init(x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
    }
}
