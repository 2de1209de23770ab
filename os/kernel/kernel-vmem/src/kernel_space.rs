//! # Kernel Half
//!
//! The kernel's own page directory, seen as the owner of the shared
//! `0xC000_0000..` range.
//!
//! Every process page directory holds a copy of the kernel PDEs taken when it
//! was created. Adding a page table to the kernel half later would therefore
//! not be seen by existing processes. Kernel mappings are only ever placed in
//! page tables that already exist; [`KernelSpace::reserve_kernel_tables`]
//! creates the ones needed at init time, before the first process.

use crate::address_space::{AddressSpace, MapError, RootPage};
use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtIndex};
use crate::page_table::{ENTRIES, join_indices, split_indices};
use crate::{FrameAlloc, PhysMapper, Privilege};
use kernel_info::memory::{KERNEL_PDT_INDEX, KERNEL_VIRTUAL_BASE, TEMP_WINDOW_VADDR};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, pages_for};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelSpaceError {
    #[error("no free kernel virtual range of {0} bytes")]
    NoVirtualSpace(u32),
    #[error("{0:?} is below the kernel half")]
    NotKernelAddress(VirtualAddress),
    #[error("no kernel page table covers {0:?}")]
    NoTable(VirtualAddress),
    #[error("out of frames for kernel page tables")]
    OutOfFrames,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Stand-in allocator for kernel mappings, which must never need a table.
struct NoTables;

impl FrameAlloc for NoTables {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        None
    }

    fn free_4k(&mut self, _page: PhysicalPage<Size4K>) {}
}

pub struct KernelSpace<'m, M: PhysMapper> {
    space: AddressSpace<'m, M>,
}

impl<'m, M: PhysMapper> KernelSpace<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M, root: RootPage) -> Self {
        Self {
            space: AddressSpace::from_root(mapper, root),
        }
    }

    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.space.root_page()
    }

    #[inline]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    /// Make sure the first `1 + extra` kernel PDEs point to page tables,
    /// allocating zeroed ones where needed.
    ///
    /// Returns how many tables were created.
    ///
    /// # Errors
    /// [`KernelSpaceError::OutOfFrames`] if a table cannot be allocated.
    /// Tables created before the failure stay in place.
    pub fn reserve_kernel_tables<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        extra: usize,
    ) -> Result<usize, KernelSpaceError> {
        let mut created = 0;
        for i in PdIndex::kernel().take(1 + extra) {
            if self.space.read_pde(i).is_present() {
                continue;
            }
            self.space
                .ensure_table(alloc, i, Privilege::Supervisor)
                .ok_or(KernelSpaceError::OutOfFrames)?;
            created += 1;
        }
        log::debug!("reserved {created} kernel page tables");
        Ok(created)
    }

    /// First kernel virtual address with `size` bytes (rounded up to pages)
    /// of unmapped, contiguous pages.
    ///
    /// Only page tables that already exist are considered, and the window
    /// slot never counts as free. Returns `None` for `size == 0` or when no
    /// such range exists.
    #[must_use]
    pub fn find_next_kernel_vaddr(&self, size: u32) -> Option<VirtualAddress> {
        let pages = pages_for(size);
        if pages == 0 {
            return None;
        }

        let mapper = self.space.mapper();
        let mut pdes = [PdEntry::zero(); ENTRIES - KERNEL_PDT_INDEX];
        unsafe {
            mapper.with_frame(self.root_page(), |pd: &mut PageDirectory| {
                pdes.copy_from_slice(pd.kernel_half());
            });
        }

        let window = VirtualAddress::new(TEMP_WINDOW_VADDR);
        let mut run_start = VirtualAddress::zero();
        let mut run_len = 0u32;
        for (pdi, pde) in PdIndex::kernel().zip(pdes) {
            let Some(pt) = pde.next_table() else {
                run_len = 0;
                continue;
            };
            let found = unsafe {
                mapper.with_frame(pt, |t: &mut PageTable| {
                    for pti in PtIndex::all() {
                        let va = join_indices(pdi, pti);
                        if va == window || t.get(pti).is_present() {
                            run_len = 0;
                            continue;
                        }
                        if run_len == 0 {
                            run_start = va;
                        }
                        run_len += 1;
                        if run_len == pages {
                            return Some(run_start);
                        }
                    }
                    None
                })
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Map `[va, va + size)` supervisor read-write, all or nothing.
    ///
    /// # Errors
    /// - [`KernelSpaceError::NotKernelAddress`] below `0xC000_0000`.
    /// - [`KernelSpaceError::NoTable`] if part of the range has no page table.
    /// - [`KernelSpaceError::Map`] if a page is already mapped or the range
    ///   is malformed; nothing stays mapped.
    pub fn map_kernel(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        size: u32,
    ) -> Result<(), KernelSpaceError> {
        if va.as_u32() < KERNEL_VIRTUAL_BASE {
            return Err(KernelSpaceError::NotKernelAddress(va));
        }
        let first = va.page::<Size4K>();
        for k in 0..pages_for(size) {
            let Some(page) = first.checked_add(k) else {
                break;
            };
            // One check per page table is enough.
            let (pdi, pti) = split_indices(page.base());
            if (k == 0 || pti.as_usize() == 0) && self.space.read_pde(pdi).next_table().is_none() {
                return Err(KernelSpaceError::NoTable(page.base()));
            }
        }
        self.space
            .map_or_unwind(&mut NoTables, pa, va, size, true, Privilege::Supervisor)?;
        Ok(())
    }

    /// Map `size` bytes at `pa` to the next free kernel range.
    ///
    /// # Errors
    /// [`KernelSpaceError::NoVirtualSpace`] when no range is free, or any
    /// error of [`map_kernel`](Self::map_kernel).
    pub fn map_anywhere(
        &self,
        pa: PhysicalAddress,
        size: u32,
    ) -> Result<VirtualAddress, KernelSpaceError> {
        let va = self
            .find_next_kernel_vaddr(size)
            .ok_or(KernelSpaceError::NoVirtualSpace(size))?;
        self.map_kernel(pa, va, size)?;
        log::trace!("kernel map {pa:?} -> {va:?} ({size} bytes)");
        Ok(va)
    }

    /// See [`AddressSpace::unmap`].
    pub fn unmap(&self, va: VirtualAddress, size: u32) -> u32 {
        self.space.unmap(va, size)
    }

    /// See [`AddressSpace::query`].
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.query(va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrames, SimKernel, SimulatedRam};

    fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn first_free_range_follows_the_kernel_image() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let ks = sim.kernel_space();

        assert_eq!(ks.find_next_kernel_vaddr(1), Some(va(0xC000_4000)));
        ks.map_kernel(pa(0x0070_0000), va(0xC000_4000), 0x2000).unwrap();
        assert_eq!(ks.find_next_kernel_vaddr(0x1000), Some(va(0xC000_6000)));
        assert_eq!(ks.find_next_kernel_vaddr(0), None);
    }

    #[test]
    fn holes_that_are_too_small_are_skipped() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let ks = sim.kernel_space();

        ks.map_kernel(pa(0x0070_0000), va(0xC000_5000), 0x1000).unwrap();
        // One free page at 0xC000_4000, then a gap of more from 0xC000_6000.
        assert_eq!(ks.find_next_kernel_vaddr(0x1000), Some(va(0xC000_4000)));
        assert_eq!(ks.find_next_kernel_vaddr(0x2000), Some(va(0xC000_6000)));
    }

    #[test]
    fn the_window_slot_is_never_handed_out() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        // The whole first table except the window slot is the kernel image.
        let sim = SimKernel::boot(&ram, &mut frames, 1023);
        let ks = sim.kernel_space();

        assert_eq!(ks.find_next_kernel_vaddr(4096), None);
        assert_eq!(
            ks.map_anywhere(pa(0x0070_0000), 4096),
            Err(KernelSpaceError::NoVirtualSpace(4096))
        );
    }

    #[test]
    fn reserved_tables_extend_the_search() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let ks = sim.kernel_space();

        assert_eq!(ks.reserve_kernel_tables(&mut frames, 2).unwrap(), 2);
        assert_eq!(ks.reserve_kernel_tables(&mut frames, 2).unwrap(), 0);

        // 8 MiB does not fit below the window but does in the two new tables.
        assert_eq!(ks.find_next_kernel_vaddr(0x0080_0000), Some(va(0xC040_0000)));
        assert_eq!(ks.find_next_kernel_vaddr(0x0080_1000), None);
    }

    #[test]
    fn kernel_maps_never_create_tables() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let ks = sim.kernel_space();

        assert_eq!(
            ks.map_kernel(pa(0x0070_0000), va(0xC080_0000), 4096),
            Err(KernelSpaceError::NoTable(va(0xC080_0000)))
        );
        // Crossing into a missing table fails before touching anything.
        assert_eq!(
            ks.map_kernel(pa(0x0070_0000), va(0xC03F_E000), 0x3000),
            Err(KernelSpaceError::NoTable(va(0xC040_0000)))
        );
        assert_eq!(ks.query(va(0xC03F_E000)), None);
        assert_eq!(
            ks.map_kernel(pa(0x0070_0000), va(0x8000_0000), 4096),
            Err(KernelSpaceError::NotKernelAddress(va(0x8000_0000)))
        );
    }

    #[test]
    fn map_anywhere_then_unmap() {
        let ram = SimulatedRam::new();
        let mut frames = BumpFrames::new(0x0100_0000, 0x0200_0000);
        let sim = SimKernel::boot(&ram, &mut frames, 4);
        let ks = sim.kernel_space();

        let at = ks.map_anywhere(pa(0x0070_0000), 0x3000).unwrap();
        assert_eq!(at, va(0xC000_4000));
        assert_eq!(ks.query(va(0xC000_6004)), Some(pa(0x0070_2004)));
        assert_eq!(ks.unmap(at, 0x3000), 3);
        assert_eq!(ks.find_next_kernel_vaddr(0x3000), Some(at));
    }
}
