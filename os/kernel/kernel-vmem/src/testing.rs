//! Host-side stand-ins for physical memory.
//!
//! [`SimulatedRam`] is sparse: frames spring into existence, zeroed, the
//! first time they are touched. [`SimBackend`] lets a [`TemporaryWindow`]
//! resolve its slot through that RAM instead of the MMU, so the window, the
//! page tables and everything built on them run unmodified in tests.

use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::{FrameAlloc, KernelSpace, PageEntryBits, TemporaryWindow, WindowBackend};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_VIRTUAL_BASE, LOW_MEMORY_END, PAGE_SIZE, TEMP_WINDOW_VADDR};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

#[repr(C, align(4096))]
struct Frame4K([u8; PAGE_SIZE as usize]);

/// Sparse simulated physical memory.
///
/// Frames are boxed individually, so pointers handed out stay valid for
/// the lifetime of the RAM.
#[derive(Default)]
pub struct SimulatedRam {
    frames: RefCell<BTreeMap<u32, NonNull<Frame4K>>>,
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        for (_, f) in core::mem::take(self.frames.get_mut()) {
            // SAFETY: every pointer came from `Box::into_raw` in `frame_ptr`.
            drop(unsafe { Box::from_raw(f.as_ptr()) });
        }
    }
}

impl SimulatedRam {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pointer to the first byte of `page`, creating the frame if needed.
    #[must_use]
    pub fn frame_ptr(&self, page: PhysicalPage<Size4K>) -> *mut u8 {
        let mut frames = self.frames.borrow_mut();
        let f = frames.entry(page.frame_number()).or_insert_with(|| {
            let frame = Box::new(Frame4K([0; PAGE_SIZE as usize]));
            // SAFETY: `Box::into_raw` never returns null.
            unsafe { NonNull::new_unchecked(Box::into_raw(frame)) }
        });
        f.as_ptr().cast()
    }

    /// Number of distinct frames touched so far.
    #[must_use]
    pub fn frames_touched(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Read `len` bytes starting at `pa`, crossing frames as needed.
    #[must_use]
    pub fn read_bytes(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut addr = pa.as_u32();
        while out.len() < len {
            let (page, off) = PhysicalAddress::new(addr).split::<Size4K>();
            let off = off.as_u32() as usize;
            let n = (PAGE_SIZE as usize - off).min(len - out.len());
            let base = self.frame_ptr(page);
            // SAFETY: `off + n` stays within the 4 KiB frame.
            let bytes = unsafe { core::slice::from_raw_parts(base.add(off), n) };
            out.extend_from_slice(bytes);
            addr = addr.wrapping_add(n as u32);
        }
        out
    }

    /// Write `bytes` starting at `pa`, crossing frames as needed.
    pub fn write_bytes(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let mut addr = pa.as_u32();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (page, off) = PhysicalAddress::new(addr).split::<Size4K>();
            let off = off.as_u32() as usize;
            let n = (PAGE_SIZE as usize - off).min(rest.len());
            let base = self.frame_ptr(page);
            // SAFETY: `off + n` stays within the 4 KiB frame.
            unsafe { core::ptr::copy_nonoverlapping(rest.as_ptr(), base.add(off), n) };
            rest = &rest[n..];
            addr = addr.wrapping_add(n as u32);
        }
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let b = self.read_bytes(pa, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

/// Window backend resolving the slot through [`SimulatedRam`].
pub struct SimBackend<'r> {
    ram: &'r SimulatedRam,
    invalidations: Cell<usize>,
}

impl<'r> SimBackend<'r> {
    #[must_use]
    pub const fn new(ram: &'r SimulatedRam) -> Self {
        Self {
            ram,
            invalidations: Cell::new(0),
        }
    }

    /// How many `invlpg`s would have been issued.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }
}

impl WindowBackend for SimBackend<'_> {
    fn window_ptr(&self, _va: VirtualAddress, pte: PtEntry) -> *mut u8 {
        self.ram.frame_ptr(pte.flags().physical_page())
    }

    fn invalidate(&self, _va: VirtualAddress) {
        self.invalidations.set(self.invalidations.get() + 1);
    }
}

/// A trivial **bump** allocator that reuses freed frames first.
///
/// Keeps counts so tests can check that everything handed out came back.
pub struct BumpFrames {
    next: u32,
    end: u32,
    freed: Vec<PhysicalPage<Size4K>>,
    live: usize,
}

impl BumpFrames {
    /// Frames from `[start, end)`.
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            next: start,
            end,
            freed: Vec::new(),
            live: 0,
        }
    }

    /// Frames allocated and not yet freed.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let page = if let Some(p) = self.freed.pop() {
            p
        } else {
            if self.end - self.next < PAGE_SIZE {
                return None;
            }
            let p = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
            self.next += PAGE_SIZE;
            p
        };
        self.live += 1;
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        assert!(!self.freed.contains(&page), "double free of {page:?}");
        self.freed.push(page);
        self.live -= 1;
    }
}

/// Kernel paging structures as a loader would leave them, built in
/// simulated RAM.
///
/// The kernel page directory has one table at PDE 768 mapping the kernel
/// image (`kernel_pages` pages from physical 1 MiB) at `0xC000_0000`. The
/// last slot of that table is the temporary window.
pub struct SimKernel<'r> {
    pub root: PhysicalPage<Size4K>,
    pub window: TemporaryWindow<SimBackend<'r>>,
}

impl<'r> SimKernel<'r> {
    /// # Panics
    /// If `frames` cannot supply the two table frames.
    pub fn boot(ram: &'r SimulatedRam, frames: &mut impl FrameAlloc, kernel_pages: u32) -> Self {
        let root = frames.alloc_4k().expect("frame for the kernel page directory");
        let pt0 = frames.alloc_4k().expect("frame for the first kernel page table");

        // SAFETY: both frames are exclusively ours and typed as tables.
        let (pd, pt) = unsafe {
            (
                &mut *ram.frame_ptr(root).cast::<PageDirectory>(),
                &mut *ram.frame_ptr(pt0).cast::<PageTable>(),
            )
        };
        pd.zero();
        pt.zero();
        pd.set(PdIndex::KERNEL_FIRST, PdEntry::make_next(pt0, PageEntryBits::new_kernel_rw()));
        for i in 0..kernel_pages {
            let va = VirtualAddress::new(KERNEL_VIRTUAL_BASE + i * PAGE_SIZE);
            let pa = PhysicalPage::from_addr(PhysicalAddress::new(LOW_MEMORY_END + i * PAGE_SIZE));
            pt.set(PtIndex::from(va), PtEntry::make_4k(pa, PageEntryBits::new_kernel_rw()));
        }

        // SAFETY: the table frame is boxed inside `ram` and outlives the window.
        let window = unsafe {
            TemporaryWindow::new(
                NonNull::new_unchecked(ram.frame_ptr(pt0).cast()),
                VirtualAddress::new(TEMP_WINDOW_VADDR),
                SimBackend::new(ram),
            )
        };
        Self { root, window }
    }

    /// The kernel half viewed through the window.
    #[must_use]
    pub const fn kernel_space(&self) -> KernelSpace<'_, TemporaryWindow<SimBackend<'r>>> {
        KernelSpace::new(&self.window, self.root)
    }
}
