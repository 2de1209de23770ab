//! # Kernel Context
//!
//! [`Kernel`] owns every piece of mutable kernel state: the frame allocator,
//! the kernel page directory (through its [`PhysMapper`]), the heap, the
//! process table and the run queue. Nothing here is global. The binary keeps
//! one instance behind an interrupt-disabling lock; tests build as many as
//! they like over simulated RAM.
//!
//! ## Bring-up order
//!
//! 1. Check the multiboot magic and derive the usable regions.
//! 2. Build the frame bitmap; its frames are mapped into the kernel half.
//! 3. Pre-create the kernel page tables every address space will share.
//! 4. Commit [`KERNEL_HEAP_INITIAL_SIZE`] bytes to the heap.

use crate::process::{ProcessHandle, ProcessTable};
use crate::scheduler::RunQueue;
use kernel_alloc::{
    BitmapFrameAlloc, FrameAllocError, HeapBacking, HeapError, HeapStats, KernelHeap,
    KernelHeapBacking, KernelHeapMemory,
};
use kernel_info::boot::{BootError, BootInfo};
use kernel_info::memory::{
    KERNEL_HEAP_INITIAL_SIZE, KERNEL_HEAP_UNIT, KERNEL_RESERVED_TABLES, PAGE_SIZE,
};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::address_space::RootPage;
use kernel_vmem::{KernelSpace, KernelSpaceError, PhysMapper};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    KernelSpace(#[from] KernelSpaceError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("no memory for the initial kernel heap")]
    HeapBacking,
    #[error("paging is not enabled")]
    PagingDisabled,
}

pub struct Kernel<'b, M: PhysMapper> {
    pub(crate) mapper: M,
    pub(crate) frames: BitmapFrameAlloc<'b>,
    pub(crate) kernel_root: RootPage,
    pub(crate) heap: KernelHeap,
    pub(crate) processes: ProcessTable,
    pub(crate) run_queue: RunQueue,
    /// The process whose context the CPU was last sent to.
    pub(crate) running: Option<ProcessHandle>,
    pub(crate) next_pid: u32,
}

impl<'b, M: PhysMapper> Kernel<'b, M> {
    /// Bring up the memory core.
    ///
    /// `mapper` reaches physical frames while paging is on, and `kernel_root`
    /// is the page directory the loader left active. `storage` turns the
    /// kernel virtual address the bitmap was mapped at, and its length in
    /// words, into a slice that lives for `'b`.
    ///
    /// # Errors
    /// - [`InitError::Boot`] for a bad magic value or an unusable memory map.
    /// - [`InitError::Frames`] if the bitmap cannot be placed.
    /// - [`InitError::KernelSpace`] if the bitmap or the kernel page tables
    ///   cannot be mapped.
    /// - [`InitError::HeapBacking`] / [`InitError::Heap`] if the initial heap
    ///   cannot be committed.
    pub fn init<F>(
        boot: &BootInfo,
        mapper: M,
        kernel_root: RootPage,
        storage: F,
    ) -> Result<Self, InitError>
    where
        F: FnOnce(VirtualAddress, usize) -> Option<&'b mut [u32]>,
    {
        boot.validate()?;
        let usable = boot.memory_map.usable_regions(&boot.kernel)?;
        log::info!(
            "{} usable regions, {} frames",
            usable.len(),
            usable.total_frames()
        );

        let space = KernelSpace::new(&mapper, kernel_root);
        let mut bitmap_mapping = None;
        let frames = BitmapFrameAlloc::init(&usable, |home: PhysicalPage<Size4K>, pages, words| {
            let result = space.map_anywhere(home.base(), pages * PAGE_SIZE);
            bitmap_mapping = Some(result);
            storage(result.ok()?, words)
        });
        let mut frames = match (frames, bitmap_mapping) {
            (Ok(frames), _) => frames,
            (Err(FrameAllocError::Storage), Some(Err(e))) => return Err(e.into()),
            (Err(e), _) => return Err(e.into()),
        };

        space.reserve_kernel_tables(&mut frames, KERNEL_RESERVED_TABLES)?;

        let mut heap = KernelHeap::new();
        let mut backing = KernelHeapBacking::new(&mut frames, &space);
        let (start, len) = backing
            .grow(KERNEL_HEAP_INITIAL_SIZE)
            .ok_or(InitError::HeapBacking)?;
        heap.init(&mut backing, start, len)?;
        log::info!("kernel heap at {start:?} ({len} bytes)");

        Ok(Self {
            mapper,
            frames,
            kernel_root,
            heap,
            processes: ProcessTable::new(),
            run_queue: RunQueue::new(),
            running: None,
            next_pid: 1,
        })
    }

    /// Allocate `size` bytes of kernel memory, aligned to
    /// [`KERNEL_HEAP_UNIT`].
    ///
    /// Returns `None` for `size == 0` or when no memory can be committed.
    pub fn kmalloc(&mut self, size: u32) -> Option<VirtualAddress> {
        self.kmalloc_aligned(size, KERNEL_HEAP_UNIT)
    }

    /// [`kmalloc`](Self::kmalloc) with an explicit power-of-two alignment.
    pub fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
        let space = KernelSpace::new(&self.mapper, self.kernel_root);
        let mut backing = KernelHeapBacking::new(&mut self.frames, &space);
        self.heap.alloc(&mut backing, size, align)
    }

    /// Release memory obtained from [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// If `va` is not a live allocation. A bad free means the heap can no
    /// longer be trusted.
    pub fn kfree(&mut self, va: VirtualAddress) {
        let space = KernelSpace::new(&self.mapper, self.kernel_root);
        if let Err(e) = self.heap.free(&mut KernelHeapMemory::new(&space), va) {
            panic!("kfree: {e}");
        }
    }

    /// Usable size of the live allocation at `va`.
    #[must_use]
    pub fn allocation_size(&self, va: VirtualAddress) -> Option<u32> {
        let space = self.kernel_space();
        self.heap.allocation_size(&KernelHeapMemory::new(&space), va)
    }

    /// The shared kernel half.
    #[must_use]
    pub const fn kernel_space(&self) -> KernelSpace<'_, M> {
        KernelSpace::new(&self.mapper, self.kernel_root)
    }

    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'b> {
        &self.frames
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }
}
