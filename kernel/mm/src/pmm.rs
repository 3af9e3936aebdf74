//! Buddy-allocator physical memory manager.
//!
//! Physical memory is partitioned into [`crate::ZoneKind`] zones (`NORMAL`,
//! `DMA`), each owning one or more physical regions. Allocation and freeing
//! are delegated to [`crate::zone::Zone`]; this module is the public,
//! zone-selecting front end: it decides which zone to search for a given
//! request and exposes the page-count based [`alloc`]/[`alloc_pages`]/
//! [`free`] API that the rest of the kernel calls.

use kestrel_core::addr::PhysAddr;
use kestrel_core::paging::{PhysFrame, Size4KiB};
use kestrel_core::sync::SpinLock;

use crate::zone::Zone;
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, PmmError, ZONE_COUNT, ZoneKind};

bitflags::bitflags! {
    /// Allocation placement hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Restrict the search to the DMA zone.
        const DMA = 1 << 0;
    }
}

/// A handle to an allocated block of `2^order` contiguous physical frames.
///
/// Carries its own order so that [`free`] does not need a separate size
/// argument: the caller passes back exactly what [`alloc`] handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    addr: PhysAddr,
    order: u8,
}

impl Page {
    /// Physical base address of this block.
    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    /// Buddy order; the block spans `2^order` frames.
    pub fn order(&self) -> usize {
        self.order as usize
    }

    /// Number of 4 KiB frames this block spans.
    pub fn frame_count(&self) -> usize {
        1usize << self.order
    }
}

static ZONES: [SpinLock<Option<Zone>>; ZONE_COUNT] = [SpinLock::new(None), SpinLock::new(None)];

/// Declares a zone's physical bounds.
///
/// Must be called once per [`ZoneKind`] before [`region_add`] assigns it
/// any memory. Calling it twice for the same kind re-declares the bounds
/// and discards whatever regions were previously registered.
pub fn zone_register(kind: ZoneKind, name: &'static str, start: PhysAddr, end: PhysAddr) {
    *ZONES[kind as usize].lock() = Some(Zone::new(name, start, end));
}

/// Assigns a contiguous physical range to whichever registered zone
/// contains it.
///
/// # Safety
///
/// `base` must be page-aligned and `[base, base + size)` must be unclaimed,
/// HHDM-accessible physical memory not otherwise in use.
pub unsafe fn region_add(base: PhysAddr, size: u64) -> Result<(), PmmError> {
    for slot in &ZONES {
        let mut guard = slot.lock();
        if let Some(zone) = guard.as_mut() {
            if zone.contains(base) {
                return unsafe { zone.region_add(base, size) };
            }
        }
    }
    Err(PmmError::ZoneNotRegistered)
}

/// Allocates a block of `2^order` contiguous frames.
///
/// With [`AllocFlags::DMA`] set, only the DMA zone is searched. Otherwise
/// `NORMAL` is tried first and `DMA` is used as a fallback.
pub fn alloc(order: usize, flags: AllocFlags) -> Option<Page> {
    let search_order = [ZoneKind::Dma];
    let default_order = [ZoneKind::Normal, ZoneKind::Dma];
    let kinds: &[ZoneKind] = if flags.contains(AllocFlags::DMA) {
        &search_order
    } else {
        &default_order
    };

    for &kind in kinds {
        let mut guard = ZONES[kind as usize].lock();
        if let Some(zone) = guard.as_mut() {
            if let Some(addr) = zone.alloc(order) {
                return Some(Page {
                    addr,
                    order: order as u8,
                });
            }
        }
    }
    None
}

/// Allocates at least `count` contiguous frames, rounding up to the next
/// power of two.
pub fn alloc_pages(count: usize, flags: AllocFlags) -> Option<Page> {
    if count == 0 {
        return None;
    }
    let order = (usize::BITS - (count - 1).leading_zeros()) as usize;
    alloc(order, flags)
}

/// Allocates a single 4 KiB frame.
pub fn alloc_page(flags: AllocFlags) -> Option<Page> {
    alloc(0, flags)
}

/// Returns a block to its owning zone, coalescing with its buddy where
/// possible.
///
/// # Panics
///
/// In debug builds, panics if `page.addr()` does not fall within any
/// registered zone's regions.
pub fn free(page: Page) {
    for slot in &ZONES {
        let mut guard = slot.lock();
        if let Some(zone) = guard.as_mut() {
            if zone.contains(page.addr) {
                zone.free(page.addr, page.order as usize);
                return;
            }
        }
    }
    debug_assert!(false, "free: {:#x} not in any registered zone", page.addr.as_u64());
}

/// Total and free frame counts for a zone, for diagnostics and tests.
pub fn zone_stats(kind: ZoneKind) -> Option<(usize, usize)> {
    let guard = ZONES[kind as usize].lock();
    guard.as_ref().map(|z| (z.total_pages(), z.free_pages()))
}

/// Adapts the global PMM to the [`FrameAllocator`]/[`FrameDeallocator`]
/// traits expected by [`crate::vmm`] and [`crate::address_space`].
pub struct PmmFrameAllocRef {
    flags: AllocFlags,
}

impl PmmFrameAllocRef {
    /// Creates a reference that allocates from the default zone search
    /// order (`NORMAL` then `DMA`).
    pub fn new() -> Self {
        Self {
            flags: AllocFlags::empty(),
        }
    }

    /// Creates a reference restricted to the DMA zone.
    pub fn dma() -> Self {
        Self {
            flags: AllocFlags::DMA,
        }
    }
}

impl Default for PmmFrameAllocRef {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl FrameAllocator<Size4KiB> for PmmFrameAllocRef {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let page = alloc_page(self.flags)?;
        Some(PhysFrame::containing_address(page.addr()))
    }
}

unsafe impl FrameDeallocator<Size4KiB> for PmmFrameAllocRef {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        free(Page {
            addr: frame.start_address(),
            order: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_zones() {
        for slot in &ZONES {
            *slot.lock() = None;
        }
    }

    fn host_region(pages: usize) -> (*mut u8, core::alloc::Layout) {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        (ptr, layout)
    }

    #[test]
    fn split_then_coalesce_back_to_single_block() {
        crate::hhdm::init(0);
        reset_zones();
        let (buf, layout) = host_region(16);
        let base = PhysAddr::new(buf as u64);
        let end = base + 16 * PAGE_SIZE as u64;

        zone_register(ZoneKind::Normal, "NORMAL", base, end);
        unsafe { region_add(base, 16 * PAGE_SIZE as u64).unwrap() };

        let a = alloc(2, AllocFlags::empty()).expect("order-2 alloc");
        assert_eq!(a.addr(), base);

        let b = alloc(0, AllocFlags::empty()).expect("order-0 alloc");
        assert_eq!(
            b.addr().as_u64(),
            base.as_u64() + 16 * PAGE_SIZE as u64 - 4 * PAGE_SIZE as u64
        );

        let (total, free_before) = zone_stats(ZoneKind::Normal).unwrap();
        assert_eq!(free_before, total - a.frame_count() - b.frame_count());

        free(a);
        free(b);

        let (total_after, free_after) = zone_stats(ZoneKind::Normal).unwrap();
        assert_eq!(total_after, total);
        assert_eq!(free_after, total);

        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn dma_flag_restricts_zone_search() {
        crate::hhdm::init(0);
        reset_zones();
        let (normal_buf, normal_layout) = host_region(4);
        let (dma_buf, dma_layout) = host_region(4);

        let normal_base = PhysAddr::new(normal_buf as u64);
        let dma_base = PhysAddr::new(dma_buf as u64);

        zone_register(
            ZoneKind::Normal,
            "NORMAL",
            normal_base,
            normal_base + 4 * PAGE_SIZE as u64,
        );
        zone_register(ZoneKind::Dma, "DMA", dma_base, dma_base + 4 * PAGE_SIZE as u64);
        unsafe {
            region_add(normal_base, 4 * PAGE_SIZE as u64).unwrap();
            region_add(dma_base, 4 * PAGE_SIZE as u64).unwrap();
        }

        let page = alloc_page(AllocFlags::DMA).expect("dma alloc");
        assert!(page.addr().as_u64() >= dma_base.as_u64());
        assert!(page.addr().as_u64() < dma_base.as_u64() + 4 * PAGE_SIZE as u64);

        free(page);
        unsafe {
            std::alloc::dealloc(normal_buf, normal_layout);
            std::alloc::dealloc(dma_buf, dma_layout);
        }
    }

    #[test]
    fn alloc_pages_rounds_up_to_power_of_two() {
        crate::hhdm::init(0);
        reset_zones();
        let (buf, layout) = host_region(16);
        let base = PhysAddr::new(buf as u64);
        zone_register(ZoneKind::Normal, "NORMAL", base, base + 16 * PAGE_SIZE as u64);
        unsafe { region_add(base, 16 * PAGE_SIZE as u64).unwrap() };

        let page = alloc_pages(3, AllocFlags::empty()).expect("alloc_pages(3)");
        assert_eq!(page.order(), 2);
        assert_eq!(page.frame_count(), 4);

        free(page);
        unsafe { std::alloc::dealloc(buf, layout) };
    }
}
