//! Per-address-space virtual region tracking (ANON / DIRECT) and
//! demand-paging fault handling.
//!
//! [`VmSpace`] holds a sorted, fixed-capacity list of [`RegionDescriptor`]s
//! describing what each virtual range in one address space means: an
//! anonymous, lazily-backed range (`ANON`), or an eagerly-mapped window onto
//! a known physical range (`DIRECT`). [`AddressSpace`](crate::address_space::AddressSpace)
//! embeds one of these to decide, on a page fault, whether to satisfy it or
//! report it unhandled.
//!
//! The region list and each ANON region's frame table are `ArrayVec`s
//! instead of heap-backed vectors: `VmSpace` is reachable from the very
//! page-fault path that would need to run before the kernel heap exists for
//! a fresh address space, so it cannot allocate through the global
//! allocator. This bounds the number of regions and the size of any single
//! ANON region per address space; both limits are generous for a process's
//! early life and are revisited if a workload needs more.

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::addr::VirtAddr;
use kestrel_core::paging::{Page, PhysFrame, Size4KiB};
use planck_noalloc::vec::ArrayVec;

use crate::mapper::{MapFlags, MapFlush, PageMapper};
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, VmmError};

static SHOOTDOWN_HOOK: AtomicU64 = AtomicU64::new(0);

/// Installs the cross-CPU TLB shootdown hook.
///
/// Called with `(root_phys, vaddr)` every time [`VmSpace::unmap`] tears down
/// a leaf mapping that was actually present, so a CPU with this address
/// space loaded elsewhere can invalidate its own stale entry. Left
/// unset, unmaps only ever flush the local TLB — correct on a single CPU,
/// stale everywhere else a writer's address space is also loaded.
///
/// `kestrel-kernel` wires this to an IPI broadcast once the LAPIC is up,
/// keeping this crate free of a dependency on interrupt dispatch.
pub fn set_tlb_shootdown_hook(hook: fn(u64, u64)) {
    SHOOTDOWN_HOOK.store(hook as usize as u64, Ordering::Release);
}

fn notify_shootdown(root_phys: u64, vaddr: u64) {
    let ptr = SHOOTDOWN_HOOK.load(Ordering::Acquire);
    if ptr != 0 {
        // SAFETY: only ever populated by `set_tlb_shootdown_hook` with a
        // `fn(u64, u64)` value.
        let hook: fn(u64, u64) = unsafe { core::mem::transmute::<usize, fn(u64, u64)>(ptr as usize) };
        hook(root_phys, vaddr);
    }
}

/// Maximum number of distinct regions tracked per address space.
pub const MAX_REGIONS: usize = 64;

/// Maximum number of pages in a single ANON region.
pub const MAX_ANON_PAGES: usize = 512;

/// What backs the pages of a region.
enum Backing {
    /// Demand-paged, zero-backed-on-first-touch anonymous memory.
    Anon {
        back_zeroed: bool,
        frames: ArrayVec<Option<PhysFrame<Size4KiB>>, MAX_ANON_PAGES>,
    },
    /// A fixed window onto a known physical range, mapped eagerly.
    Direct { phys_base: kestrel_core::addr::PhysAddr },
}

struct RegionDescriptor {
    start: VirtAddr,
    pages: usize,
    flags: MapFlags,
    backing: Backing,
}

impl RegionDescriptor {
    fn end(&self) -> VirtAddr {
        self.start + (self.pages * PAGE_SIZE) as u64
    }

    fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    fn overlaps(&self, start: VirtAddr, pages: usize) -> bool {
        let end = start + (pages * PAGE_SIZE) as u64;
        start.as_u64() < self.end().as_u64() && end.as_u64() > self.start.as_u64()
    }
}

/// Placement behavior for [`VmSpace::map_anon`] / [`VmSpace::map_direct`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Place exactly at `hint`; fail if the range is already occupied.
    Fixed,
    /// Use `hint` as a starting point and scan forward for the first gap
    /// that fits, wrapping once at `search_end`.
    Anywhere,
}

/// The set of virtual regions belonging to one address space.
pub struct VmSpace {
    regions: ArrayVec<RegionDescriptor, MAX_REGIONS>,
    search_base: VirtAddr,
    search_end: VirtAddr,
}

impl VmSpace {
    /// Creates an empty region set. New `Anywhere` placements are searched
    /// for within `[search_base, search_end)`.
    pub const fn new(search_base: VirtAddr, search_end: VirtAddr) -> Self {
        Self {
            regions: ArrayVec::new(),
            search_base,
            search_end,
        }
    }

    fn find_gap(&self, hint: VirtAddr, pages: usize) -> Option<VirtAddr> {
        let size = (pages * PAGE_SIZE) as u64;
        let mut candidate = if hint.as_u64() >= self.search_base.as_u64() {
            hint
        } else {
            self.search_base
        };

        let mut sorted: ArrayVec<(VirtAddr, VirtAddr), MAX_REGIONS> = ArrayVec::new();
        for r in self.regions.iter() {
            let _ = sorted.try_push((r.start, r.end()));
        }
        sorted.as_mut_slice().sort_unstable_by_key(|(start, _)| start.as_u64());

        for (start, end) in sorted.iter() {
            if candidate.as_u64() + size <= start.as_u64() {
                break;
            }
            if candidate.as_u64() < end.as_u64() {
                candidate = *end;
            }
        }

        if candidate.as_u64() + size <= self.search_end.as_u64() {
            Some(candidate)
        } else {
            None
        }
    }

    fn insert_sorted(&mut self, descriptor: RegionDescriptor) -> Result<(), VmmError> {
        if self.regions.is_full() {
            return Err(VmmError::RegionExhausted);
        }
        let pos = self
            .regions
            .iter()
            .position(|r| r.start.as_u64() > descriptor.start.as_u64())
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, descriptor);
        Ok(())
    }

    /// Reserves a demand-paged anonymous region.
    ///
    /// No physical frames are allocated until [`VmSpace::fault`] is called
    /// for a page within the range.
    pub fn map_anon(
        &mut self,
        hint: VirtAddr,
        length: u64,
        flags: MapFlags,
        placement: Placement,
        back_zeroed: bool,
    ) -> Result<VirtAddr, VmmError> {
        if length == 0 || length % PAGE_SIZE as u64 != 0 || hint.as_u64() % PAGE_SIZE as u64 != 0 {
            return Err(VmmError::InvalidArgument);
        }
        let pages = (length / PAGE_SIZE as u64) as usize;
        if pages > MAX_ANON_PAGES {
            return Err(VmmError::InvalidArgument);
        }

        let start = match placement {
            Placement::Fixed => {
                if self.regions.iter().any(|r| r.overlaps(hint, pages)) {
                    return Err(VmmError::AlreadyMapped);
                }
                hint
            }
            Placement::Anywhere => self.find_gap(hint, pages).ok_or(VmmError::RegionExhausted)?,
        };

        let mut frames = ArrayVec::new();
        for _ in 0..pages {
            frames.try_push(None).map_err(|_| VmmError::InvalidArgument)?;
        }

        self.insert_sorted(RegionDescriptor {
            start,
            pages,
            flags,
            backing: Backing::Anon { back_zeroed, frames },
        })?;
        Ok(start)
    }

    /// Maps a fixed physical window into the address space, eagerly.
    pub fn map_direct<M: PageMapper<Size4KiB>>(
        &mut self,
        mapper: &M,
        root: kestrel_core::addr::PhysAddr,
        hint: VirtAddr,
        phys_base: kestrel_core::addr::PhysAddr,
        length: u64,
        flags: MapFlags,
        placement: Placement,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<VirtAddr, VmmError> {
        if length == 0
            || length % PAGE_SIZE as u64 != 0
            || hint.as_u64() % PAGE_SIZE as u64 != 0
            || phys_base.as_u64() % PAGE_SIZE as u64 != 0
        {
            return Err(VmmError::InvalidArgument);
        }
        let pages = (length / PAGE_SIZE as u64) as usize;

        let start = match placement {
            Placement::Fixed => {
                if self.regions.iter().any(|r| r.overlaps(hint, pages)) {
                    return Err(VmmError::AlreadyMapped);
                }
                hint
            }
            Placement::Anywhere => self.find_gap(hint, pages).ok_or(VmmError::RegionExhausted)?,
        };

        for i in 0..pages {
            let page = Page::<Size4KiB>::containing_address(start + (i * PAGE_SIZE) as u64);
            let frame = PhysFrame::<Size4KiB>::containing_address(phys_base + (i * PAGE_SIZE) as u64);
            // SAFETY: `root` is this address space's own PML4; `alloc`
            // supplies zeroed intermediate page-table frames.
            let flush: MapFlush = unsafe {
                mapper.map(root, page, frame, flags, &mut || {
                    alloc.allocate_frame().expect("out of memory mapping intermediate page table")
                })
            };
            flush.ignore();
        }

        self.insert_sorted(RegionDescriptor {
            start,
            pages,
            flags,
            backing: Backing::Direct { phys_base },
        })?;
        Ok(start)
    }

    /// Unmaps `[addr, addr + length)`, splitting or removing any number of
    /// overlapping regions as needed and freeing any ANON frames that were
    /// faulted in.
    pub fn unmap<M: PageMapper<Size4KiB>>(
        &mut self,
        mapper: &M,
        root: kestrel_core::addr::PhysAddr,
        addr: VirtAddr,
        length: u64,
        dealloc: &mut impl FrameDeallocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        if length == 0 || length % PAGE_SIZE as u64 != 0 || addr.as_u64() % PAGE_SIZE as u64 != 0 {
            return Err(VmmError::InvalidArgument);
        }
        let unmap_pages = (length / PAGE_SIZE as u64) as usize;
        let unmap_end = addr + length;

        // A range can span any number of adjacent regions (two back-to-back
        // placements, or remainders from a prior split); re-scan after each
        // removal since `insert_sorted`/`remove` shift indices.
        let mut any = false;
        while let Some(idx) = self.regions.iter().position(|r| r.overlaps(addr, unmap_pages)) {
            any = true;
            self.unmap_region_at(mapper, root, addr, unmap_end, dealloc, idx)?;
        }

        if any { Ok(()) } else { Err(VmmError::NotMapped) }
    }

    fn unmap_region_at<M: PageMapper<Size4KiB>>(
        &mut self,
        mapper: &M,
        root: kestrel_core::addr::PhysAddr,
        addr: VirtAddr,
        unmap_end: VirtAddr,
        dealloc: &mut impl FrameDeallocator<Size4KiB>,
        idx: usize,
    ) -> Result<(), VmmError> {
        let region = self.regions.remove(idx);

        // Unmap and free every page in the removed range that actually fell
        // within the original region (callers may ask for a superset).
        let lo = addr.as_u64().max(region.start.as_u64());
        let hi = unmap_end.as_u64().min(region.end().as_u64());
        let mut frame_slot = 0usize;
        let mut pa = region.start;
        while pa.as_u64() < region.end().as_u64() {
            if pa.as_u64() >= lo && pa.as_u64() < hi {
                let page = Page::<Size4KiB>::containing_address(pa);
                let was_mapped = match &region.backing {
                    Backing::Anon { frames, .. } => frames[frame_slot].is_some(),
                    Backing::Direct { .. } => true,
                };
                if was_mapped {
                    // SAFETY: `root` is this address space's own PML4.
                    if let Ok((frame, flush)) = unsafe { mapper.unmap(root, page) } {
                        flush.flush();
                        notify_shootdown(root.as_u64(), page.start_address().as_u64());
                        if matches!(region.backing, Backing::Anon { .. }) {
                            // SAFETY: the frame was allocated by the same PMM
                            // that backs `dealloc`, and is no longer mapped.
                            unsafe { dealloc.deallocate_frame(frame) };
                        }
                    }
                }
            }
            frame_slot += 1;
            pa = pa + PAGE_SIZE as u64;
        }

        let region_end = region.end().as_u64();
        let leading_pages = ((lo - region.start.as_u64()) / PAGE_SIZE as u64) as usize;
        let trailing_pages = ((region_end - hi) / PAGE_SIZE as u64) as usize;
        let start = region.start;
        let flags = region.flags;

        // Split the backing into (leading remainder, trailing remainder) in
        // a single consuming match so an `Anon` frame table is moved out
        // exactly once, then re-insert whichever halves survived the unmap.
        let (leading_backing, trailing_backing) = match region.backing {
            Backing::Anon { back_zeroed, frames } => {
                let mut lead = ArrayVec::new();
                for i in 0..leading_pages {
                    let _ = lead.try_push(frames[i]);
                }
                let mut trail = ArrayVec::new();
                for i in (region.pages - trailing_pages)..region.pages {
                    let _ = trail.try_push(frames[i]);
                }
                (
                    Backing::Anon { back_zeroed, frames: lead },
                    Backing::Anon { back_zeroed, frames: trail },
                )
            }
            Backing::Direct { phys_base } => (
                Backing::Direct { phys_base },
                Backing::Direct {
                    phys_base: phys_base + ((region.pages - trailing_pages) * PAGE_SIZE) as u64,
                },
            ),
        };

        if leading_pages > 0 {
            self.insert_sorted(RegionDescriptor {
                start,
                pages: leading_pages,
                flags,
                backing: leading_backing,
            })?;
        }
        if trailing_pages > 0 {
            self.insert_sorted(RegionDescriptor {
                start: VirtAddr::new_truncate(hi),
                pages: trailing_pages,
                flags,
                backing: trailing_backing,
            })?;
        }

        Ok(())
    }

    /// Services a page fault at `addr`.
    ///
    /// For ANON regions, allocates and maps a fresh frame on first touch.
    /// DIRECT regions are mapped eagerly at `map_direct` time, so a fault
    /// inside one indicates the mapping was torn down unexpectedly.
    pub fn fault<M: PageMapper<Size4KiB>>(
        &mut self,
        mapper: &M,
        root: kestrel_core::addr::PhysAddr,
        addr: VirtAddr,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(addr))
            .ok_or(VmmError::FaultUnhandled)?;

        let page_addr = VirtAddr::new_truncate(addr.as_u64() & !(PAGE_SIZE as u64 - 1));
        let index = ((page_addr.as_u64() - region.start.as_u64()) / PAGE_SIZE as u64) as usize;

        let Backing::Anon { back_zeroed, frames } = &mut region.backing else {
            return Err(VmmError::FaultUnhandled);
        };

        if frames[index].is_some() {
            return Err(VmmError::AlreadyMapped);
        }

        let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        if *back_zeroed {
            // SAFETY: the frame was just allocated and is not yet mapped
            // anywhere else; the mapper's HHDM covers all physical memory.
            unsafe {
                let virt = crate::hhdm::phys_to_virt(frame.start_address());
                crate::zero_frame(virt.as_mut_ptr());
            }
        }

        let page = Page::<Size4KiB>::containing_address(page_addr);
        // SAFETY: `root` is this address space's own PML4.
        let flush = unsafe {
            mapper.map(root, page, frame, region.flags, &mut || {
                alloc.allocate_frame().expect("out of memory mapping intermediate page table")
            })
        };
        flush.flush();
        frames[index] = Some(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_regions_do_not_overlap() {
        let mut space = VmSpace::new(VirtAddr::new(0x1000_0000), VirtAddr::new(0x2000_0000));
        let a = space
            .map_anon(
                VirtAddr::new(0x1000_0000),
                4 * PAGE_SIZE as u64,
                MapFlags::WRITABLE,
                Placement::Anywhere,
                true,
            )
            .unwrap();
        let b = space
            .map_anon(
                VirtAddr::new(0x1000_0000),
                4 * PAGE_SIZE as u64,
                MapFlags::WRITABLE,
                Placement::Anywhere,
                true,
            )
            .unwrap();
        assert_ne!(a, b);
        assert!(b.as_u64() >= a.as_u64() + 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn fixed_placement_rejects_overlap() {
        let mut space = VmSpace::new(VirtAddr::new(0x1000_0000), VirtAddr::new(0x2000_0000));
        let hint = VirtAddr::new(0x1000_0000);
        space
            .map_anon(hint, 4 * PAGE_SIZE as u64, MapFlags::WRITABLE, Placement::Fixed, true)
            .unwrap();
        let err = space
            .map_anon(hint, PAGE_SIZE as u64, MapFlags::WRITABLE, Placement::Fixed, true)
            .unwrap_err();
        assert_eq!(err, VmmError::AlreadyMapped);
    }

    #[test]
    fn rejects_unaligned_length() {
        let mut space = VmSpace::new(VirtAddr::new(0x1000_0000), VirtAddr::new(0x2000_0000));
        let err = space
            .map_anon(VirtAddr::new(0x1000_0000), 100, MapFlags::WRITABLE, Placement::Anywhere, true)
            .unwrap_err();
        assert_eq!(err, VmmError::InvalidArgument);
    }
}
