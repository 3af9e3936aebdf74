//! The unhandled-exception reporter.
//!
//! Every one of the 32 CPU exception vectors is wired, at boot, to one of
//! the four thin wrappers below (their signatures differ only because the
//! hardware ABI pushes an error code for some vectors and not others).
//! Each wrapper's body is the same one-line call into [`report`], which
//! prints the full machine state and halts. This collapses the teacher's
//! per-exception panic sites into the single generic reporter the vector
//! table's exception range is specified to install.

use core::sync::atomic::{AtomicPtr, Ordering};

use kestrel_core::arch::x86_64::instructions::interrupts;
use kestrel_core::arch::x86_64::structures::idt::InterruptStackFrame;
use kestrel_core::arch::x86_64::structures::machine_state::MachineState;

/// Names the kernel virtual region a page-fault address falls into.
///
/// Set by whatever crate owns the kernel's virtual layout so this crate never
/// needs to depend on it directly — see [`set_fault_region_fn`].
pub type FaultRegionFn = fn(u64) -> &'static str;

fn null_fault_region(_addr: u64) -> &'static str {
    "unknown"
}

static FAULT_REGION_FN: AtomicPtr<()> = AtomicPtr::new(null_fault_region as *mut ());

/// Registers the function used to name a page fault's virtual region in
/// crash reports.
///
/// # Safety
///
/// The provided function must be safe to call from exception context with
/// interrupts disabled.
pub unsafe fn set_fault_region_fn(f: FaultRegionFn) {
    FAULT_REGION_FN.store(f as *mut (), Ordering::Release);
}

fn load_fault_region_fn() -> FaultRegionFn {
    let ptr = FAULT_REGION_FN.load(Ordering::Acquire);
    // SAFETY: only valid `FaultRegionFn` pointers are ever stored.
    unsafe { core::mem::transmute(ptr) }
}

/// Human-readable names for vectors 0-31, indexed by vector number.
const NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Reserved",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security Exception",
    "Reserved",
];

const PAGE_FAULT_VECTOR: u8 = 14;

/// Prints the faulting vector's name, the full machine state, and CR2 (for
/// page faults), then halts this CPU forever.
fn report(vector: u8, frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    let state = MachineState::from_interrupt_frame(frame);
    let name = NAMES[vector as usize];
    match error_code {
        Some(code) if vector == PAGE_FAULT_VECTOR => {
            let region = load_fault_region_fn()(state.cr2);
            kestrel_core::kerr!(
                "unhandled exception: {name} (vector {vector}, error_code={code:#x}, region={region})\n{state}"
            )
        }
        Some(code) => kestrel_core::kerr!(
            "unhandled exception: {name} (vector {vector}, error_code={code:#x})\n{state}"
        ),
        None => kestrel_core::kerr!("unhandled exception: {name} (vector {vector})\n{state}"),
    }
    loop {
        interrupts::disable();
        interrupts::hlt();
    }
}

macro_rules! named_plain {
    ($(($fn_name:ident, $vector:expr)),* $(,)?) => {
        $(
            /// Reports an unhandled exception with no error code.
            pub extern "x86-interrupt" fn $fn_name(frame: InterruptStackFrame) {
                report($vector, &frame, None)
            }
        )*
    };
}

macro_rules! named_with_err {
    ($(($fn_name:ident, $vector:expr)),* $(,)?) => {
        $(
            /// Reports an unhandled exception with an error code.
            pub extern "x86-interrupt" fn $fn_name(frame: InterruptStackFrame, error_code: u64) {
                report($vector, &frame, Some(error_code))
            }
        )*
    };
}

macro_rules! named_diverging {
    ($(($fn_name:ident, $vector:expr)),* $(,)?) => {
        $(
            /// Reports an unhandled exception with no error code; never returns.
            pub extern "x86-interrupt" fn $fn_name(frame: InterruptStackFrame) -> ! {
                report($vector, &frame, None)
            }
        )*
    };
}

macro_rules! named_diverging_with_err {
    ($(($fn_name:ident, $vector:expr)),* $(,)?) => {
        $(
            /// Reports an unhandled exception with an error code; never returns.
            pub extern "x86-interrupt" fn $fn_name(frame: InterruptStackFrame, error_code: u64) -> ! {
                report($vector, &frame, Some(error_code))
            }
        )*
    };
}

named_plain! {
    (divide_error, 0),
    (debug, 1),
    (nmi, 2),
    (breakpoint, 3),
    (overflow, 4),
    (bound_range, 5),
    (invalid_opcode, 6),
    (device_not_available, 7),
    (x87_floating_point, 16),
    (simd_floating_point, 19),
    (virtualization, 20),
    (hypervisor_injection, 28),
}

named_with_err! {
    (invalid_tss, 10),
    (segment_not_present, 11),
    (stack_segment_fault, 12),
    (general_protection, 13),
    (page_fault, 14),
    (alignment_check, 17),
    (control_protection, 21),
    (vmm_communication, 29),
    (security_exception, 30),
}

named_diverging! {
    (machine_check, 18),
}

named_diverging_with_err! {
    (double_fault, 8),
}
