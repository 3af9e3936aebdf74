//! Higher-half direct map (HHDM) offset bookkeeping.
//!
//! The bootloader identity-maps all physical memory at a fixed virtual
//! offset. Everything in this crate that needs to touch a physical address
//! directly (page-table walks, the PMM's free-list links) goes through this
//! offset rather than threading it through every call.

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::addr::{PhysAddr, VirtAddr};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the HHDM offset reported by the bootloader.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(offset: u64) {
    let prev = HHDM_OFFSET.swap(offset, Ordering::SeqCst);
    assert_eq!(prev, 0, "HHDM offset already initialized");
}

/// Returns the current HHDM offset.
pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::SeqCst)
}

/// Translates a physical address to its HHDM virtual address.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(offset() + phys.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_to_virt_applies_offset() {
        HHDM_OFFSET.store(0xFFFF_8000_0000_0000, Ordering::SeqCst);
        let virt = phys_to_virt(PhysAddr::new(0x1000));
        assert_eq!(virt.as_u64(), 0xFFFF_8000_0000_1000);
    }
}
