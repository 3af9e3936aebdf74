//! Per-CPU GDT/TSS bring-up and the `RSP0` hook handed to `kestrel-sched`.
//!
//! Every CPU gets its own GDT and TSS, each heap-allocated and leaked for
//! the life of the kernel: the double-fault IST stack and `RSP0` are
//! per-CPU state, and sharing one TSS across CPUs would let one CPU's
//! context switch clobber another's ring-0 stack pointer.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use kestrel_core::arch::x86_64::structures::gdt::{
    Descriptor, GlobalDescriptorTable, SegmentSelector, TaskStateSegment,
};
use kestrel_core::id::CpuId;
use kestrel_core::percpu::{CpuLocal, MAX_CPUS};

const DOUBLE_FAULT_STACK_SIZE: usize = 16384;

/// IST index used for the double-fault handler (1-indexed, as the IDT
/// wants it).
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

#[repr(align(16))]
struct AlignedStack([u8; DOUBLE_FAULT_STACK_SIZE]);

const ZERO_STACK: AlignedStack = AlignedStack([0; DOUBLE_FAULT_STACK_SIZE]);

/// One double-fault stack per CPU, indexed by [`CpuId`].
static DOUBLE_FAULT_STACKS: [AlignedStack; MAX_CPUS] = [ZERO_STACK; MAX_CPUS];

const ZERO_PTR: AtomicU64 = AtomicU64::new(0);

/// Leaked `&'static TaskStateSegment` addresses, one per CPU.
static TSS_PTRS: CpuLocal<AtomicU64> = CpuLocal::new([ZERO_PTR; MAX_CPUS]);

/// Segment selectors. Identical on every CPU since each CPU's GDT is built
/// with the same append order; cached from the bootstrap processor's
/// build so later CPUs and callers don't need a live GDT reference.
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

static SEL_KERNEL_CODE: AtomicU16 = AtomicU16::new(0);
static SEL_KERNEL_DATA: AtomicU16 = AtomicU16::new(0);
static SEL_USER_CODE: AtomicU16 = AtomicU16::new(0);
static SEL_USER_DATA: AtomicU16 = AtomicU16::new(0);
static SEL_TSS: AtomicU16 = AtomicU16::new(0);

/// Returns the cached segment selectors. Valid once any CPU has run
/// [`init`].
pub fn selectors() -> Selectors {
    Selectors {
        kernel_code: SegmentSelector::from_raw(SEL_KERNEL_CODE.load(Ordering::Relaxed)),
        kernel_data: SegmentSelector::from_raw(SEL_KERNEL_DATA.load(Ordering::Relaxed)),
        user_code: SegmentSelector::from_raw(SEL_USER_CODE.load(Ordering::Relaxed)),
        user_data: SegmentSelector::from_raw(SEL_USER_DATA.load(Ordering::Relaxed)),
        tss: SegmentSelector::from_raw(SEL_TSS.load(Ordering::Relaxed)),
    }
}

/// Builds this CPU's GDT and TSS, loads them, and reloads every segment
/// register.
///
/// `kestrel-sched`'s user/kernel selector constants
/// (`kestrel_sched::context::{USER_DATA_SELECTOR, USER_CODE_SELECTOR}`)
/// assume this exact append order: kernel_code, kernel_data, user_data,
/// user_code, tss. user_data comes before user_code because SYSRET derives
/// SS from `STAR[63:48]+8` and CS from `STAR[63:48]+16`, which only lines
/// up in this order.
///
/// # Safety
///
/// Must run exactly once per CPU, after `kestrel_core::percpu`'s GS base
/// is programmed for this CPU (the TSS's initial `RSP0` reads
/// `current_cpu().kernel_rsp`) and before interrupts are enabled on it.
pub unsafe fn init(cpu_id: CpuId) {
    let stack = &DOUBLE_FAULT_STACKS[cpu_id.as_usize()];
    let stack_top = stack as *const AlignedStack as u64 + DOUBLE_FAULT_STACK_SIZE as u64;

    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[(DOUBLE_FAULT_IST_INDEX - 1) as usize] = stack_top;
    tss.privilege_stack_table[0] = kestrel_core::percpu::current_cpu().kernel_rsp;
    // SAFETY: leaked for the life of the kernel; never freed or aliased
    // mutably again.
    let tss: &'static TaskStateSegment = Box::leak(Box::new(tss));
    TSS_PTRS.get_for(cpu_id).store(core::ptr::from_ref(tss) as u64, Ordering::Release);

    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss_sel = gdt.append(Descriptor::tss_segment(tss));

    SEL_KERNEL_CODE.store(kernel_code.as_u16(), Ordering::Relaxed);
    SEL_KERNEL_DATA.store(kernel_data.as_u16(), Ordering::Relaxed);
    SEL_USER_CODE.store(user_code.as_u16(), Ordering::Relaxed);
    SEL_USER_DATA.store(user_data.as_u16(), Ordering::Relaxed);
    SEL_TSS.store(tss_sel.as_u16(), Ordering::Relaxed);

    // SAFETY: leaked for the life of the kernel.
    let gdt: &'static GlobalDescriptorTable = Box::leak(Box::new(gdt));

    use kestrel_core::arch::x86_64::instructions::segmentation::{
        load_ds, load_es, load_fs, load_gs, load_ss, load_tss, set_cs,
    };
    // SAFETY: the descriptors above are valid and match the reloads below.
    unsafe {
        gdt.load();
        set_cs(kernel_code);
        load_ds(kernel_data);
        load_ss(kernel_data);
        load_es(SegmentSelector::new(0, 0));
        load_fs(SegmentSelector::new(0, 0));
        load_gs(SegmentSelector::new(0, 0));
        load_tss(tss_sel);
    }
}

/// Programs `RSP0` in the running CPU's TSS. Installed as `kestrel-sched`'s
/// TSS hook via [`kestrel_sched::set_tss_rsp0_hook`], so every context
/// switch lands a ring-3 trap on the right kernel stack.
///
/// # Safety
///
/// `rsp` must be the top of a valid, mapped kernel stack. Must be called
/// with interrupts disabled (true of every `kestrel-sched` switch), and
/// only after [`init`] has run on this CPU.
pub unsafe fn set_tss_rsp0(rsp: u64) {
    let ptr = TSS_PTRS.get().load(Ordering::Acquire);
    debug_assert!(ptr != 0, "set_tss_rsp0 called before gdt::init on this CPU");
    // SAFETY: `ptr` was leaked by `init` and never freed; caller's contract
    // covers serialization.
    unsafe { (*(ptr as *mut TaskStateSegment)).privilege_stack_table[0] = rsp };
}
