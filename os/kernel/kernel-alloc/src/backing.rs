//! Heap memory and heap growth in the kernel half.

use crate::frame_alloc::BitmapFrameAlloc;
use crate::heap::{Header, HeapBacking, HeapMemory};
use kernel_info::memory::{KERNEL_HEAP_UNIT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, pages_for};
use kernel_vmem::{KernelSpace, PhysMapper};

/// Heap headers, reached through the kernel mappings and the mapper.
pub struct KernelHeapMemory<'a, 'm, M: PhysMapper> {
    space: &'a KernelSpace<'m, M>,
}

impl<'a, 'm, M: PhysMapper> KernelHeapMemory<'a, 'm, M> {
    pub const fn new(space: &'a KernelSpace<'m, M>) -> Self {
        Self { space }
    }

    /// Frame and word index of the header at `at`.
    fn locate(&self, at: VirtualAddress) -> Option<(PhysicalPage<Size4K>, usize)> {
        if !at.as_u32().is_multiple_of(KERNEL_HEAP_UNIT) {
            return None;
        }
        let pa = self.space.query(at)?;
        Some((pa.page::<Size4K>(), (pa.offset::<Size4K>().as_u32() / 4) as usize))
    }
}

impl<M: PhysMapper> HeapMemory for KernelHeapMemory<'_, '_, M> {
    fn read_header(&self, at: VirtualAddress) -> Option<Header> {
        let (page, word) = self.locate(at)?;
        let mapper = self.space.address_space().mapper();
        // SAFETY: heap frames are plain words and nobody holds a reference
        // into them here.
        let header = unsafe {
            mapper.with_frame(page, |f: &mut [u32; 1024]| Header {
                units: f[word],
                link: f[word + 1],
            })
        };
        Some(header)
    }

    fn write_header(&mut self, at: VirtualAddress, header: Header) {
        let Some((page, word)) = self.locate(at) else {
            panic!("heap header at {at:?} is not mapped");
        };
        let mapper = self.space.address_space().mapper();
        // SAFETY: as above.
        unsafe {
            mapper.with_frame(page, |f: &mut [u32; 1024]| {
                f[word] = header.units;
                f[word + 1] = header.link;
            });
        }
    }
}

/// Grows the kernel heap by mapping free frames at the next free kernel
/// virtual range. The frames need not be physically contiguous.
pub struct KernelHeapBacking<'a, 'b, 'm, M: PhysMapper> {
    frames: &'a mut BitmapFrameAlloc<'b>,
    memory: KernelHeapMemory<'a, 'm, M>,
}

impl<'a, 'b, 'm, M: PhysMapper> KernelHeapBacking<'a, 'b, 'm, M> {
    pub const fn new(frames: &'a mut BitmapFrameAlloc<'b>, space: &'a KernelSpace<'m, M>) -> Self {
        Self {
            frames,
            memory: KernelHeapMemory::new(space),
        }
    }

    /// Unmap the first `pages` pages at `start` and return their frames.
    fn release(&mut self, start: VirtualAddress, pages: u32) {
        let space = self.memory.space;
        for k in 0..pages {
            let va = start + k * PAGE_SIZE;
            if let Some(pa) = space.query(va) {
                space.unmap(va, PAGE_SIZE);
                let _ = self.frames.free(pa);
            }
        }
    }
}

impl<M: PhysMapper> HeapMemory for KernelHeapBacking<'_, '_, '_, M> {
    fn read_header(&self, at: VirtualAddress) -> Option<Header> {
        self.memory.read_header(at)
    }

    fn write_header(&mut self, at: VirtualAddress, header: Header) {
        self.memory.write_header(at, header);
    }
}

impl<M: PhysMapper> HeapBacking for KernelHeapBacking<'_, '_, '_, M> {
    fn grow(&mut self, min_bytes: u32) -> Option<(VirtualAddress, u32)> {
        let pages = pages_for(min_bytes);
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        let space = self.memory.space;
        let Some(start) = space.find_next_kernel_vaddr(bytes) else {
            log::warn!("heap backing: no free kernel range of {bytes} bytes");
            return None;
        };

        // Largest runs first, halving whenever the bitmap has none that long.
        let mut mapped = 0;
        let mut run = pages;
        while mapped < pages {
            run = run.min(pages - mapped);
            let Some(pa) = self.frames.allocate(run) else {
                if run > 1 {
                    run = run.div_ceil(2);
                    continue;
                }
                log::warn!("heap backing: out of frames after {mapped} of {pages} pages");
                self.release(start, mapped);
                return None;
            };
            if let Err(e) = space.map_kernel(pa, start + mapped * PAGE_SIZE, run * PAGE_SIZE) {
                log::warn!("heap backing: {e}");
                // Frames came from this allocator a moment ago.
                let _ = self.frames.free_contiguous(pa, run);
                self.release(start, mapped);
                return None;
            }
            log::trace!("heap backing: {run} pages {pa:?} at page {mapped}");
            mapped += run;
        }
        log::debug!("heap backing: {pages} pages at {start:?}");
        Some((start, bytes))
    }
}
