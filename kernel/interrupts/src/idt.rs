//! IDT assembly: wires the 32 exception vectors to the reporter in
//! [`crate::exceptions`] and vectors 32-255 to [`crate::table::dispatch`]
//! via generated stub functions.

use kestrel_core::arch::x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};
use kestrel_core::sync::LazyLock;

use crate::exceptions;
use crate::table;

/// Number of hardware interrupt vectors (32-255).
const NUM_HARDWARE_VECTORS: usize = 224;

type StubFn = extern "x86-interrupt" fn(InterruptStackFrame);

/// Generates a stub for hardware vector `32 + $offset` that forwards into
/// the dispatch table. One monomorphized function per vector is required
/// because the IDT stores bare function pointers, not closures.
macro_rules! stub {
    ($offset:expr) => {{
        extern "x86-interrupt" fn stub(_frame: InterruptStackFrame) {
            table::dispatch($offset + 32);
        }
        stub as StubFn
    }};
}

/// `STUBS[i]` handles hardware vector `i + 32`.
#[rustfmt::skip]
static STUBS: [StubFn; NUM_HARDWARE_VECTORS] = [
    stub!(0), stub!(1), stub!(2), stub!(3), stub!(4), stub!(5), stub!(6), stub!(7),
    stub!(8), stub!(9), stub!(10), stub!(11), stub!(12), stub!(13), stub!(14), stub!(15),
    stub!(16), stub!(17), stub!(18), stub!(19), stub!(20), stub!(21), stub!(22), stub!(23),
    stub!(24), stub!(25), stub!(26), stub!(27), stub!(28), stub!(29), stub!(30), stub!(31),
    stub!(32), stub!(33), stub!(34), stub!(35), stub!(36), stub!(37), stub!(38), stub!(39),
    stub!(40), stub!(41), stub!(42), stub!(43), stub!(44), stub!(45), stub!(46), stub!(47),
    stub!(48), stub!(49), stub!(50), stub!(51), stub!(52), stub!(53), stub!(54), stub!(55),
    stub!(56), stub!(57), stub!(58), stub!(59), stub!(60), stub!(61), stub!(62), stub!(63),
    stub!(64), stub!(65), stub!(66), stub!(67), stub!(68), stub!(69), stub!(70), stub!(71),
    stub!(72), stub!(73), stub!(74), stub!(75), stub!(76), stub!(77), stub!(78), stub!(79),
    stub!(80), stub!(81), stub!(82), stub!(83), stub!(84), stub!(85), stub!(86), stub!(87),
    stub!(88), stub!(89), stub!(90), stub!(91), stub!(92), stub!(93), stub!(94), stub!(95),
    stub!(96), stub!(97), stub!(98), stub!(99), stub!(100), stub!(101), stub!(102), stub!(103),
    stub!(104), stub!(105), stub!(106), stub!(107), stub!(108), stub!(109), stub!(110), stub!(111),
    stub!(112), stub!(113), stub!(114), stub!(115), stub!(116), stub!(117), stub!(118), stub!(119),
    stub!(120), stub!(121), stub!(122), stub!(123), stub!(124), stub!(125), stub!(126), stub!(127),
    stub!(128), stub!(129), stub!(130), stub!(131), stub!(132), stub!(133), stub!(134), stub!(135),
    stub!(136), stub!(137), stub!(138), stub!(139), stub!(140), stub!(141), stub!(142), stub!(143),
    stub!(144), stub!(145), stub!(146), stub!(147), stub!(148), stub!(149), stub!(150), stub!(151),
    stub!(152), stub!(153), stub!(154), stub!(155), stub!(156), stub!(157), stub!(158), stub!(159),
    stub!(160), stub!(161), stub!(162), stub!(163), stub!(164), stub!(165), stub!(166), stub!(167),
    stub!(168), stub!(169), stub!(170), stub!(171), stub!(172), stub!(173), stub!(174), stub!(175),
    stub!(176), stub!(177), stub!(178), stub!(179), stub!(180), stub!(181), stub!(182), stub!(183),
    stub!(184), stub!(185), stub!(186), stub!(187), stub!(188), stub!(189), stub!(190), stub!(191),
    stub!(192), stub!(193), stub!(194), stub!(195), stub!(196), stub!(197), stub!(198), stub!(199),
    stub!(200), stub!(201), stub!(202), stub!(203), stub!(204), stub!(205), stub!(206), stub!(207),
    stub!(208), stub!(209), stub!(210), stub!(211), stub!(212), stub!(213), stub!(214), stub!(215),
    stub!(216), stub!(217), stub!(218), stub!(219), stub!(220), stub!(221), stub!(222), stub!(223),
];

/// The interrupt vector the scheduler preemption tick and LAPIC timer use.
pub const TIMER_VECTOR: u8 = 254;
/// The spurious interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 255;

static IDT: LazyLock<InterruptDescriptorTable> = LazyLock::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    idt.divide_error.set_handler(exceptions::divide_error);
    idt.debug.set_handler(exceptions::debug);
    idt.nmi.set_handler(exceptions::nmi);
    idt.breakpoint.set_handler(exceptions::breakpoint).set_dpl(3);
    idt.overflow.set_handler(exceptions::overflow);
    idt.bound_range.set_handler(exceptions::bound_range);
    idt.invalid_opcode.set_handler(exceptions::invalid_opcode);
    idt.device_not_available.set_handler(exceptions::device_not_available);
    idt.double_fault
        .set_diverging_handler_with_err_code(exceptions::double_fault)
        .set_ist_index(double_fault_ist_index());
    idt.invalid_tss.set_handler_with_err_code(exceptions::invalid_tss);
    idt.segment_not_present.set_handler_with_err_code(exceptions::segment_not_present);
    idt.stack_segment_fault.set_handler_with_err_code(exceptions::stack_segment_fault);
    idt.general_protection.set_handler_with_err_code(exceptions::general_protection);
    idt.page_fault.set_handler_with_err_code(exceptions::page_fault);
    idt.x87_floating_point.set_handler(exceptions::x87_floating_point);
    idt.alignment_check.set_handler_with_err_code(exceptions::alignment_check);
    idt.machine_check.set_diverging_handler(exceptions::machine_check);
    idt.simd_floating_point.set_handler(exceptions::simd_floating_point);
    idt.virtualization.set_handler(exceptions::virtualization);
    idt.control_protection.set_handler_with_err_code(exceptions::control_protection);
    idt.hypervisor_injection.set_handler(exceptions::hypervisor_injection);
    idt.vmm_communication.set_handler_with_err_code(exceptions::vmm_communication);
    idt.security_exception.set_handler_with_err_code(exceptions::security_exception);

    for (offset, stub) in STUBS.iter().enumerate() {
        idt[offset as u8 + 32].set_handler(*stub);
    }

    idt
});

/// The IST index configured for the double-fault handler's stack, set once
/// by [`init`] before the IDT is lazily built.
static DOUBLE_FAULT_IST_INDEX: core::sync::atomic::AtomicU8 = core::sync::atomic::AtomicU8::new(1);

fn double_fault_ist_index() -> u8 {
    DOUBLE_FAULT_IST_INDEX.load(core::sync::atomic::Ordering::Relaxed)
}

/// Installs the exception reporter across vectors 0-31 and loads the IDT.
///
/// `double_fault_ist_index` selects which TSS interrupt-stack-table slot
/// the double-fault handler runs on; it must already be programmed into
/// the running CPU's TSS.
///
/// # Safety
///
/// Must be called after the GDT (and its TSS, if `double_fault_ist_index`
/// is nonzero) is loaded, since CS must already be valid.
pub unsafe fn init(double_fault_ist_index: u8) {
    DOUBLE_FAULT_IST_INDEX.store(double_fault_ist_index, core::sync::atomic::Ordering::Relaxed);
    table::install_exceptions(exception_trap);
    unsafe { IDT.load() };
}

/// Placeholder registered in the dispatch table for exception vectors.
///
/// The IDT routes exceptions directly to the named wrappers in
/// [`crate::exceptions`], which never return (or panic before returning);
/// this function exists only so [`table::install_exceptions`] has a
/// well-typed handler to mark the range claimed, and is never actually
/// invoked through [`table::dispatch`].
fn exception_trap(_vector: u8) {
    unreachable!("exception vectors are routed directly by the IDT, not through dispatch()")
}
