//! Local APIC driver: MMIO register access for EOI, inter-processor
//! interrupts, and the one-shot timer the scheduler arms for preemption.

use bitflags::bitflags;
use kestrel_core::addr::VirtAddr;
use kestrel_core::sync::SpinLock;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ISR_BASE: u32 = 0x100;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INITIAL: u32 = 0x380;
const REG_TIMER_CURRENT: u32 = 0x390;
const REG_TIMER_DIVIDE: u32 = 0x3E0;

const SVR_ENABLE: u32 = 1 << 8;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
/// Divide bus clock by 16 for the timer's count register.
const TIMER_DIVIDE_BY_16: u32 = 0b0011;

bitflags! {
    /// Delivery-mode and level bits for [`LocalApic::ipi`], ORed with the
    /// target vector into the low ICR dword.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpiFlags: u32 {
        /// Fixed delivery mode: deliver to the vector's handler.
        const FIXED = 0;
        /// INIT delivery mode, used during AP bring-up.
        const INIT = 0b101 << 8;
        /// STARTUP (SIPI) delivery mode, used during AP bring-up.
        const STARTUP = 0b110 << 8;
        /// Assert (rather than de-assert) the level for INIT/STARTUP.
        const ASSERT = 1 << 14;
    }
}

/// Local APIC driver using MMIO register access.
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// # Safety
    ///
    /// `base` must be a valid, permanent mapping of the running CPU's LAPIC
    /// 4 KiB MMIO window.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    /// Returns this processor's APIC id.
    pub fn id(&self) -> u8 {
        ((self.read_reg(REG_ID) >> 24) & 0xFF) as u8
    }

    /// Enables the LAPIC with the given spurious-interrupt vector.
    pub fn enable(&self, spurious_vector: u8) {
        self.write_reg(REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
    }

    /// Sends EOI for `vector`, but only if its in-service bit is actually
    /// set. Guards against acknowledging a spurious or already-serviced
    /// interrupt.
    pub fn eoi(&self, vector: u8) {
        if self.in_service(vector) {
            self.write_reg(REG_EOI, 0);
        }
    }

    fn in_service(&self, vector: u8) -> bool {
        let reg = REG_ISR_BASE + 0x10 * (u32::from(vector) / 32);
        let bit = u32::from(vector) % 32;
        (self.read_reg(reg) >> bit) & 1 != 0
    }

    /// Sends an inter-processor interrupt to `lapic_id`.
    ///
    /// # Safety
    ///
    /// The caller must ensure `lapic_id` names a valid target and that
    /// `flags` is appropriate for the delivery being performed (e.g.
    /// `STARTUP` only as part of a correctly sequenced AP bring-up).
    pub unsafe fn ipi(&self, lapic_id: u8, vector: u8, flags: IpiFlags) {
        self.write_reg(REG_ICR_HIGH, u32::from(lapic_id) << 24);
        self.write_reg(REG_ICR_LOW, flags.bits() | u32::from(vector));
        while self.read_reg(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    /// Arms the timer to fire `vector` once after `ticks` bus cycles
    /// (divided by 16).
    pub fn timer_oneshot(&self, vector: u8, ticks: u32) {
        self.write_reg(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        self.write_reg(REG_LVT_TIMER, u32::from(vector));
        self.write_reg(REG_TIMER_INITIAL, ticks);
    }

    /// Returns the timer's current count (ticks remaining).
    pub fn timer_current_count(&self) -> u32 {
        self.read_reg(REG_TIMER_CURRENT)
    }

    #[inline]
    fn read_reg(&self, offset: u32) -> u32 {
        // SAFETY: `new`'s caller guarantees `self.base` maps the LAPIC's
        // MMIO page; every offset used here falls within it.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + u64::from(offset)) as *const u32) }
    }

    #[inline]
    fn write_reg(&self, offset: u32, value: u32) {
        // SAFETY: see `read_reg`.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + u64::from(offset)) as *mut u32, value);
        }
    }
}

/// The running CPU's LAPIC, set once during bring-up. `None` until then —
/// `eoi`/`ipi`/`timer_oneshot` calls before bring-up are silently dropped,
/// matching the teacher's pre-LAPIC-init dispatch behavior.
static CURRENT: SpinLock<Option<LocalApic>> = SpinLock::new(None);

/// Records `lapic` as this CPU's LAPIC driver.
///
/// # Safety
///
/// `lapic` must wrap a valid, permanently mapped LAPIC MMIO window for the
/// calling CPU.
pub unsafe fn init(lapic: LocalApic) {
    *CURRENT.lock() = Some(lapic);
}

/// Sends EOI for `vector` via the running CPU's LAPIC, if initialized.
pub fn eoi(vector: u8) {
    if let Some(lapic) = CURRENT.lock().as_ref() {
        lapic.eoi(vector);
    }
}

/// Arms the running CPU's LAPIC timer. No-op if the LAPIC isn't initialized.
pub fn timer_oneshot(vector: u8, ticks: u32) {
    if let Some(lapic) = CURRENT.lock().as_ref() {
        lapic.timer_oneshot(vector, ticks);
    }
}

/// Sends an IPI via the running CPU's LAPIC, if initialized.
///
/// # Safety
///
/// See [`LocalApic::ipi`].
pub unsafe fn ipi(lapic_id: u8, vector: u8, flags: IpiFlags) {
    if let Some(lapic) = CURRENT.lock().as_ref() {
        unsafe { lapic.ipi(lapic_id, vector, flags) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipi_flags_compose() {
        let flags = IpiFlags::INIT | IpiFlags::ASSERT;
        assert!(flags.contains(IpiFlags::INIT));
        assert!(flags.contains(IpiFlags::ASSERT));
        assert!(!flags.contains(IpiFlags::STARTUP));
    }
}
