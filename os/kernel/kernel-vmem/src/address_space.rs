//! # Address Space (i386, PD-rooted)
//!
//! Helpers to build and manipulate a **single** virtual address space: a
//! page directory plus the page tables it points to.
//!
//! ## Highlights
//!
//! - [`AddressSpace::create`] allocates a page directory sharing the kernel
//!   half of an existing one.
//! - [`AddressSpace::map`] installs a range of 4 KiB mappings, creating page
//!   tables on demand, and reports how far it got.
//! - [`AddressSpace::unmap`] clears a range.
//! - [`AddressSpace::query`] translates a virtual address.
//! - [`AddressSpace::release_user_tables`] hands the user-half tables and
//!   the directory itself back to the frame allocator.
//!
//! ## Design
//!
//! - Tables are reached through a [`PhysMapper`] one at a time; a directory
//!   entry is read in one scope and the page table opened in the next.
//! - Mapped frames are never freed here. Their owner does that.

use crate::page_table::pd::{PageDirectory, PdEntry, PdEntryKind, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::{ENTRIES, split_indices};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, Privilege, zero_frame};
use kernel_info::memory::{KERNEL_PDT_INDEX, PAGE_SIZE};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, pages_for,
};

/// Why a [`map`](AddressSpace::map) failed or stopped early.
///
/// Failures after the first page carry the number of bytes mapped, so
/// callers can unwind the prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("{va:?} is already mapped (after {mapped} bytes)")]
    AlreadyMapped { va: VirtualAddress, mapped: u32 },
    #[error("out of frames for a page table (after {mapped} bytes)")]
    OutOfFrames { mapped: u32 },
    #[error("range at {va:?} wraps past 4 GiB")]
    Overflow { va: VirtualAddress },
    #[error("{0:#010x} is not page aligned")]
    Misaligned(u32),
}

impl MapError {
    /// Bytes mapped before the failure.
    #[must_use]
    pub const fn mapped(&self) -> u32 {
        match *self {
            Self::AlreadyMapped { mapped, .. } | Self::OutOfFrames { mapped } => mapped,
            Self::Overflow { .. } | Self::Misaligned(_) => 0,
        }
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>, // PD frame
    mapper: &'m M,
}

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// View an existing page directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate a fresh page directory whose kernel half is copied from
    /// `kernel_root` and whose user half is empty.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the directory.
    pub fn create<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel_root: RootPage,
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfFrames { mapped: 0 })?;

        let mut kernel = [PdEntry::zero(); ENTRIES - KERNEL_PDT_INDEX];
        unsafe {
            mapper.with_frame(kernel_root, |pd: &mut PageDirectory| {
                kernel.copy_from_slice(pd.kernel_half());
            });
            mapper.with_frame(root, |pd: &mut PageDirectory| {
                pd.zero();
                pd.kernel_half_mut().copy_from_slice(&kernel);
            });
        }

        log::trace!("created page directory {root:?}");
        Ok(Self { root, mapper })
    }

    /// Physical page of the PD.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    pub(crate) fn read_pde(&self, i: PdIndex) -> PdEntry {
        unsafe { self.mapper.with_frame(self.root, |pd: &mut PageDirectory| pd.get(i)) }
    }

    fn write_pde(&self, i: PdIndex, e: PdEntry) {
        unsafe { self.mapper.with_frame(self.root, |pd: &mut PageDirectory| pd.set(i, e)) }
    }

    /// The page table behind PDE `i`, allocating and linking a zeroed one if
    /// the entry is empty. User mappings also open up an existing PDE for
    /// ring 3.
    pub(crate) fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        i: PdIndex,
        privilege: Privilege,
    ) -> Option<PhysicalPage<Size4K>> {
        let pde = self.read_pde(i);
        if let Some(pt) = pde.next_table() {
            if privilege == Privilege::User && !pde.flags().user_access() {
                let flags = pde.flags().with_user_access(true);
                self.write_pde(i, PdEntry::make_next(pt, flags));
            }
            return Some(pt);
        }
        debug_assert!(!pde.is_present(), "4 MiB leaf in the way of {i:?}");

        let pt = alloc.alloc_4k()?;
        unsafe { zero_frame(self.mapper, pt) };
        let flags = PageEntryBits::new_kernel_rw().with_user_access(privilege == Privilege::User);
        self.write_pde(i, PdEntry::make_next(pt, flags));
        log::trace!("new page table {pt:?} for PDE {}", i.as_usize());
        Some(pt)
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` with 4 KiB pages.
    ///
    /// `size` is rounded up to whole pages. Missing page tables are
    /// allocated from `alloc`. Mapping stops at the first page that is
    /// already present or when a page table cannot be allocated; pages
    /// mapped up to that point stay mapped.
    ///
    /// Returns the number of bytes mapped.
    ///
    /// # Errors
    /// - [`MapError::Misaligned`] if `va` or `pa` is not page aligned.
    /// - [`MapError::Overflow`] if either range wraps past 4 GiB.
    /// - [`MapError::AlreadyMapped`] / [`MapError::OutOfFrames`] with the
    ///   bytes mapped so far.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        pa: PhysicalAddress,
        va: VirtualAddress,
        size: u32,
        writable: bool,
        privilege: Privilege,
    ) -> Result<u32, MapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(MapError::Misaligned(va.as_u32()));
        }
        if !pa.is_aligned::<Size4K>() {
            return Err(MapError::Misaligned(pa.as_u32()));
        }
        let pages = pages_for(size);
        let span = pages.checked_mul(PAGE_SIZE).ok_or(MapError::Overflow { va })?;
        if pages > 0 && (va.checked_add(span - 1).is_none() || pa.checked_add(span - 1).is_none()) {
            return Err(MapError::Overflow { va });
        }

        let leaf = PageEntryBits::new_leaf(writable, privilege);
        let mut mapped = 0;
        for k in 0..pages {
            let page_va = va + k * PAGE_SIZE;
            let page_pa = PhysicalPage::from_addr(pa + k * PAGE_SIZE);
            let (pdi, pti) = split_indices(page_va);

            let pt = self
                .ensure_table(alloc, pdi, privilege)
                .ok_or(MapError::OutOfFrames { mapped })?;

            let placed = unsafe {
                self.mapper.with_frame(pt, |t: &mut PageTable| {
                    if t.get(pti).is_present() {
                        return false;
                    }
                    t.set(pti, PtEntry::make_4k(page_pa, leaf));
                    true
                })
            };
            if !placed {
                return Err(MapError::AlreadyMapped {
                    va: page_va,
                    mapped,
                });
            }
            mapped += PAGE_SIZE;
        }
        Ok(mapped)
    }

    /// [`map`](Self::map), but a failure removes whatever prefix was mapped.
    ///
    /// # Errors
    /// As [`map`](Self::map); on return nothing of the range is mapped.
    pub fn map_or_unwind<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        pa: PhysicalAddress,
        va: VirtualAddress,
        size: u32,
        writable: bool,
        privilege: Privilege,
    ) -> Result<(), MapError> {
        match self.map(alloc, pa, va, size, writable, privilege) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.mapped() > 0 {
                    self.unmap(va, e.mapped());
                }
                Err(e)
            }
        }
    }

    /// Clear the PTEs of `[va, va + size)` and invalidate their TLB entries.
    ///
    /// Holes are skipped. Page tables and mapped frames are not freed.
    /// Returns the number of entries cleared.
    pub fn unmap(&self, va: VirtualAddress, size: u32) -> u32 {
        let first = va.page::<Size4K>();
        let mut cleared = 0;
        for k in 0..pages_for(size) {
            let Some(page) = first.checked_add(k) else {
                break;
            };
            let page_va = page.base();
            let (pdi, pti) = split_indices(page_va);
            let Some(pt) = self.read_pde(pdi).next_table() else {
                continue;
            };
            let was_present = unsafe {
                self.mapper.with_frame(pt, |t: &mut PageTable| {
                    let present = t.get(pti).is_present();
                    t.set(pti, PtEntry::zero());
                    present
                })
            };
            if was_present {
                self.mapper.invalidate(page_va);
                cleared += 1;
            }
        }
        cleared
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped.
    ///
    /// The in-page offset is preserved; 4 MiB leaves are honoured.
    #[doc(alias = "get_physical")]
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (pdi, pti) = split_indices(va);
        match self.read_pde(pdi).kind()? {
            PdEntryKind::Leaf4MiB(base, _) => Some(base.join(va.offset::<Size4M>())),
            PdEntryKind::NextPageTable(pt, _) => {
                let pte = unsafe { self.mapper.with_frame(pt, |t: &mut PageTable| t.get(pti)) };
                Some(pte.page_4k()?.join(va.offset::<Size4K>()))
            }
        }
    }

    /// The PTE translating `va`, if its page table exists.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (pdi, pti) = split_indices(va);
        let pt = self.read_pde(pdi).next_table()?;
        Some(unsafe { self.mapper.with_frame(pt, |t: &mut PageTable| t.get(pti)) })
    }

    /// Free every user-half page table and then the directory itself.
    ///
    /// Mappings must already have been torn down by their owner; the frames
    /// they pointed to are not touched. The kernel half is shared and left
    /// alone.
    pub fn release_user_tables<A: FrameAlloc>(self, alloc: &mut A) {
        let mut released = 0;
        for i in PdIndex::user() {
            if let Some(pt) = self.read_pde(i).next_table() {
                alloc.free_4k(pt);
                released += 1;
            }
        }
        alloc.free_4k(self.root);
        log::trace!("released {released} page tables and directory {:?}", self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrames, SimKernel, SimulatedRam};

    const USER: Privilege = Privilege::User;

    fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn map_then_query_then_unmap() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        let mapped = aspace
            .map(&mut frames, pa(0x0050_0000), va(0x8000_0000), 0x3000, true, USER)
            .unwrap();
        assert_eq!(mapped, 0x3000);

        for k in 0..3 {
            assert_eq!(
                aspace.query(va(0x8000_0000 + k * 4096 + 0x123)),
                Some(pa(0x0050_0000 + k * 4096 + 0x123))
            );
        }
        assert_eq!(aspace.query(va(0x8000_3000)), None);

        let pte = aspace.leaf_entry(va(0x8000_0000)).unwrap();
        assert!(pte.flags().user_access() && pte.flags().writable());

        assert_eq!(aspace.unmap(va(0x8000_0000), 0x3000), 3);
        assert_eq!(aspace.query(va(0x8000_1000)), None);
    }

    #[test]
    fn size_is_rounded_up_to_pages() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        let mapped = aspace
            .map(&mut frames, pa(0x0050_0000), va(0x1000_0000), 1, false, USER)
            .unwrap();
        assert_eq!(mapped, 4096);
        assert_eq!(aspace.map(&mut frames, pa(0x0050_0000), va(0x1000_0000), 0, false, USER), Ok(0));
    }

    #[test]
    fn stops_at_the_first_present_page() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        aspace
            .map(&mut frames, pa(0x0060_0000), va(0x0040_2000), 0x1000, true, USER)
            .unwrap();

        let err = aspace
            .map(&mut frames, pa(0x0050_0000), va(0x0040_0000), 0x4000, true, USER)
            .unwrap_err();
        assert_eq!(
            err,
            MapError::AlreadyMapped {
                va: va(0x0040_2000),
                mapped: 0x2000
            }
        );
        // The prefix stays, the existing mapping is untouched.
        assert_eq!(aspace.query(va(0x0040_1000)), Some(pa(0x0050_1000)));
        assert_eq!(aspace.query(va(0x0040_2000)), Some(pa(0x0060_0000)));
    }

    #[test]
    fn map_or_unwind_removes_the_prefix() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        aspace
            .map(&mut frames, pa(0x0060_0000), va(0x0040_2000), 0x1000, true, USER)
            .unwrap();
        let err = aspace
            .map_or_unwind(&mut frames, pa(0x0050_0000), va(0x0040_0000), 0x4000, true, USER)
            .unwrap_err();
        assert_eq!(err.mapped(), 0x2000);
        assert_eq!(aspace.query(va(0x0040_0000)), None);
        assert_eq!(aspace.query(va(0x0040_1000)), None);
        assert_eq!(aspace.query(va(0x0040_2000)), Some(pa(0x0060_0000)));
    }

    #[test]
    fn running_out_of_table_frames_reports_progress() {
        let ram = SimulatedRam::new();
        // Kernel PD + PT, the new PD and exactly one page table.
        let mut frames = BumpFrames::new(0x0100_0000, 0x0100_4000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        // Crosses from PDE 0 into PDE 1, which needs a second table.
        let err = aspace
            .map(&mut frames, pa(0x0050_0000), va(0x003F_E000), 0x4000, true, USER)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfFrames { mapped: 0x2000 });
    }

    #[test]
    fn misaligned_and_wrapping_ranges_are_rejected() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        assert_eq!(
            aspace.map(&mut frames, pa(0x0050_0000), va(0x1000_0010), 4096, true, USER),
            Err(MapError::Misaligned(0x1000_0010))
        );
        assert_eq!(
            aspace.map(&mut frames, pa(0x0050_0000), va(0xFFFF_F000), 0x2000, true, USER),
            Err(MapError::Overflow { va: va(0xFFFF_F000) })
        );
    }

    #[test]
    fn new_spaces_share_the_kernel_half() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let kernel = AddressSpace::from_root(&sim.window, sim.root);
        let user = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        // The kernel image mapping is visible from the new space.
        assert_eq!(user.query(va(0xC000_1000)), Some(pa(0x0010_1000)));
        // Kernel mappings made later through an existing table show up too.
        kernel
            .map(&mut frames, pa(0x0070_0000), va(0xC010_0000), 4096, true, Privilege::Supervisor)
            .unwrap();
        assert_eq!(user.query(va(0xC010_0000)), Some(pa(0x0070_0000)));
        // User mappings stay private.
        user.map(&mut frames, pa(0x0050_0000), va(0x8000_0000), 4096, true, USER)
            .unwrap();
        assert_eq!(kernel.query(va(0x8000_0000)), None);
    }

    #[test]
    fn release_returns_every_table_frame() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let baseline = frames.live();

        let user = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();
        user.map(&mut frames, pa(0x0050_0000), va(0x0000_0000), 4096, true, USER)
            .unwrap();
        user.map(&mut frames, pa(0x0050_0000), va(0x8000_0000), 4096, true, USER)
            .unwrap();
        user.map(&mut frames, pa(0x0050_0000), va(0xBFFF_F000), 4096, true, USER)
            .unwrap();
        assert_eq!(frames.live(), baseline + 4);

        user.unmap(va(0x0000_0000), 4096);
        user.unmap(va(0x8000_0000), 4096);
        user.unmap(va(0xBFFF_F000), 4096);
        user.release_user_tables(&mut frames);
        assert_eq!(frames.live(), baseline);
    }

    #[test]
    fn kernel_pde_gains_user_access_only_for_user_maps() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let aspace = AddressSpace::create(&sim.window, &mut frames, sim.root).unwrap();

        aspace
            .map(&mut frames, pa(0x0050_0000), va(0x0800_0000), 4096, true, Privilege::Supervisor)
            .unwrap();
        assert!(!aspace.read_pde(PdIndex::from(va(0x0800_0000))).flags().user_access());
        aspace
            .map(&mut frames, pa(0x0050_1000), va(0x0800_1000), 4096, true, USER)
            .unwrap();
        assert!(aspace.read_pde(PdIndex::from(va(0x0800_0000))).flags().user_access());
    }
}
