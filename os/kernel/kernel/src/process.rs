//! # Processes
//!
//! A process is a private page directory plus three regions backed by
//! frames from the bitmap allocator:
//!
//! ```text
//!  0x8000_0000          code       user rw, the image bytes
//!  0xC000_0000 - n*4K   user stack user rw, zeroed, esp = 0xBFFF_FFFC
//!  kernel half          kernel stack, one page, mapped at the next free
//!                       kernel address (shared by all address spaces)
//! ```
//!
//! Frames are taken in the longest runs the bitmap has and mapped as soon as
//! they are taken, so a region needs no physical contiguity and no limit on
//! its number of runs. The page tables are the record of them: [`FrameRuns`]
//! reads a region back as `(base, count)` runs, which is how
//! [`Kernel::destroy_process`] hands every frame back. Creation either
//! succeeds completely or leaves no trace.
//!
//! Process control blocks live in a fixed [`ProcessTable`]. Handles carry a
//! generation, so a handle kept past `destroy` no longer resolves.

use crate::context::Kernel;
use crate::interrupts::Registers;
use core::fmt;
use kernel_alloc::BitmapFrameAlloc;
use kernel_info::memory::{
    KERNEL_STACK_SIZE, MAX_PROCESSES, PAGE_SIZE, USER_CODE_VADDR, USER_INITIAL_ESP,
    USER_STACK_PAGES, USER_STACK_TOP,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, pages_for};
use kernel_sync::IrqGuard;
use kernel_vmem::address_space::{AddressSpace, MapError, RootPage};
use kernel_vmem::{
    KernelSpace, KernelSpaceError, PhysMapper, Privilege, fill_frame, zero_frame,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub(crate) u32);

impl Pid {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Generation-checked reference to a [`ProcessTable`] slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    index: usize,
    generation: u32,
}

/// `count` physically contiguous frames starting at `base`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameRun {
    pub base: PhysicalAddress,
    pub count: u32,
}

impl FrameRun {
    #[must_use]
    pub const fn bytes(&self) -> u32 {
        self.count * PAGE_SIZE
    }
}

/// The frames behind a region, read from its page tables and merged into
/// runs. Yields each run with the virtual address it is mapped at.
pub struct FrameRuns<'a, 'm, M: PhysMapper> {
    space: &'a AddressSpace<'m, M>,
    va: VirtualAddress,
    left: u32,
}

impl<'a, 'm, M: PhysMapper> FrameRuns<'a, 'm, M> {
    #[must_use]
    pub const fn new(space: &'a AddressSpace<'m, M>, start: VirtualAddress, pages: u32) -> Self {
        Self {
            space,
            va: start,
            left: pages,
        }
    }

    fn step(&mut self) {
        self.va += PAGE_SIZE;
        self.left -= 1;
    }
}

impl<M: PhysMapper> Iterator for FrameRuns<'_, '_, M> {
    type Item = (VirtualAddress, FrameRun);

    fn next(&mut self) -> Option<Self::Item> {
        let (start, base) = loop {
            if self.left == 0 {
                return None;
            }
            let va = self.va;
            self.step();
            if let Some(pa) = self.space.query(va) {
                break (va, pa);
            }
        };
        let mut count = 1;
        while self.left > 0 && self.space.query(self.va) == Some(base + count * PAGE_SIZE) {
            self.step();
            count += 1;
        }
        Some((start, FrameRun { base, count }))
    }
}

/// What to load into a new process.
#[derive(Debug, Copy, Clone)]
pub struct ProcessImage<'a> {
    /// Copied to [`USER_CODE_VADDR`]; the tail of the last page is zeroed.
    pub code: &'a [u8],
    /// Offset of the first instruction within `code`.
    pub entry_offset: u32,
    pub stack_pages: u32,
}

impl<'a> ProcessImage<'a> {
    #[must_use]
    pub const fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            entry_offset: 0,
            stack_pages: USER_STACK_PAGES,
        }
    }

    #[must_use]
    pub const fn with_entry_offset(mut self, offset: u32) -> Self {
        self.entry_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_stack_pages(mut self, pages: u32) -> Self {
        self.stack_pages = pages;
        self
    }
}

/// Process control block.
#[derive(Debug, Copy, Clone)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub root: RootPage,
    /// Where the process resumes; updated on every switch away from it.
    pub current: Registers,
    /// The context the process was created with.
    pub user_mode: Registers,
    pub code_start: VirtualAddress,
    pub code_pages: u32,
    pub stack_start: VirtualAddress,
    pub stack_pages: u32,
    pub kernel_stack_start: VirtualAddress,
    /// `esp0` for ring transitions while this process runs.
    pub kernel_stack_top: VirtualAddress,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("process table is full")]
    TableFull,
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("process image is empty")]
    EmptyImage,
    #[error("entry offset {0:#x} is outside the image")]
    EntryOutOfRange(u32),
    #[error("code and stack do not fit the user address range")]
    ImageTooLarge,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    KernelSpace(#[from] KernelSpaceError),
    #[error("no such process")]
    UnknownProcess,
    #[error("{0} is running")]
    Running(Pid),
}

struct Slot {
    generation: u32,
    process: Option<Process>,
}

impl Slot {
    const VACANT: Self = Self {
        generation: 0,
        process: None,
    };
}

/// Fixed arena of [`MAX_PROCESSES`] process control blocks.
pub struct ProcessTable {
    slots: [Slot; MAX_PROCESSES],
    len: usize,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [Slot::VACANT; MAX_PROCESSES],
            len: 0,
        }
    }

    /// Store `process` in the first vacant slot.
    pub fn insert(&mut self, process: Process) -> Option<ProcessHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.process.is_none())?;
        slot.process = Some(process);
        self.len += 1;
        Some(ProcessHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Take the process out; the handle and any copies of it go stale.
    pub fn remove(&mut self, handle: ProcessHandle) -> Option<Process> {
        let slot = self.slot_mut(handle)?;
        let process = slot.process.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(process)
    }

    #[must_use]
    pub fn get(&self, handle: ProcessHandle) -> Option<&Process> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)?
            .process
            .as_ref()
    }

    pub fn get_mut(&mut self, handle: ProcessHandle) -> Option<&mut Process> {
        self.slot_mut(handle)?.process.as_mut()
    }

    fn slot_mut(&mut self, handle: ProcessHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessHandle, &Process)> {
        self.slots.iter().enumerate().filter_map(|(index, s)| {
            let handle = ProcessHandle {
                index,
                generation: s.generation,
            };
            s.process.as_ref().map(|p| (handle, p))
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len == MAX_PROCESSES
    }
}

/// Everything a process holds, whether fully built or not. Page counts
/// cover only what is mapped.
#[derive(Default)]
struct Resources {
    root: Option<RootPage>,
    code_pages: u32,
    stack_start: Option<VirtualAddress>,
    stack_pages: u32,
    kernel_stack_va: Option<VirtualAddress>,
}

impl From<&Process> for Resources {
    fn from(p: &Process) -> Self {
        Self {
            root: Some(p.root),
            code_pages: p.code_pages,
            stack_start: Some(p.stack_start),
            stack_pages: p.stack_pages,
            kernel_stack_va: Some(p.kernel_stack_start),
        }
    }
}

impl<M: PhysMapper> Kernel<'_, M> {
    /// Build a process from `image` and append it to the run queue.
    ///
    /// # Errors
    /// Any [`ProcessError`] describing the step that failed. Every frame,
    /// table and mapping taken up to that point has been released again.
    pub fn create_process(
        &mut self,
        image: &ProcessImage<'_>,
        parent: Option<Pid>,
    ) -> Result<ProcessHandle, ProcessError> {
        let _irq = IrqGuard::new();
        if self.processes.is_full() {
            return Err(ProcessError::TableFull);
        }

        let mut taken = Resources::default();
        let built = self.build(image, &mut taken);
        let handle = built.and_then(|mut process| {
            let pid = Pid(self.next_pid);
            process.pid = pid;
            process.parent = parent;
            let handle = self
                .processes
                .insert(process)
                .ok_or(ProcessError::TableFull)?;
            self.next_pid += 1;
            log::info!(
                "{pid} created: root {:?}, entry {:#010x}, kernel stack top {:?}",
                process.root,
                process.user_mode.eip,
                process.kernel_stack_top
            );
            Ok(handle)
        });

        match handle {
            Ok(handle) => {
                self.run_queue.push_back(handle);
                Ok(handle)
            }
            Err(e) => {
                log::warn!("process creation failed: {e}");
                self.release(taken);
                Err(e)
            }
        }
    }

    /// Tear down a process that is not currently running.
    ///
    /// It leaves the run queue, its kernel stack is unmapped, and its frames,
    /// page tables and page directory go back to the frame allocator.
    ///
    /// # Errors
    /// [`ProcessError::UnknownProcess`] for a stale handle,
    /// [`ProcessError::Running`] for the process the CPU was last sent to.
    pub fn destroy_process(&mut self, handle: ProcessHandle) -> Result<Pid, ProcessError> {
        let _irq = IrqGuard::new();
        let pid = self
            .processes
            .get(handle)
            .ok_or(ProcessError::UnknownProcess)?
            .pid;
        if self.running == Some(handle) {
            return Err(ProcessError::Running(pid));
        }

        let process = self
            .processes
            .remove(handle)
            .ok_or(ProcessError::UnknownProcess)?;
        self.run_queue.remove(handle);
        self.release(Resources::from(&process));
        log::info!("{pid} destroyed");
        Ok(pid)
    }

    #[must_use]
    pub fn process(&self, handle: ProcessHandle) -> Option<&Process> {
        self.processes.get(handle)
    }

    #[must_use]
    pub fn find_process(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes
            .iter()
            .find_map(|(h, p)| (p.pid == pid).then_some(h))
    }

    pub fn processes(&self) -> impl Iterator<Item = (ProcessHandle, &Process)> {
        self.processes.iter()
    }

    /// The private address space of a process.
    #[must_use]
    pub fn address_space(&self, handle: ProcessHandle) -> Option<AddressSpace<'_, M>> {
        let root = self.processes.get(handle)?.root;
        Some(AddressSpace::from_root(&self.mapper, root))
    }

    /// The pid and parent are filled in by the caller.
    fn build(
        &mut self,
        image: &ProcessImage<'_>,
        taken: &mut Resources,
    ) -> Result<Process, ProcessError> {
        let code_len = u32::try_from(image.code.len()).map_err(|_| ProcessError::ImageTooLarge)?;
        if code_len == 0 {
            return Err(ProcessError::EmptyImage);
        }
        if image.entry_offset >= code_len {
            return Err(ProcessError::EntryOutOfRange(image.entry_offset));
        }
        let code_pages = pages_for(code_len);
        let stack_pages = image.stack_pages.max(1);
        if code_pages + stack_pages > (USER_STACK_TOP - USER_CODE_VADDR) / PAGE_SIZE {
            return Err(ProcessError::ImageTooLarge);
        }

        let space = AddressSpace::create(&self.mapper, &mut self.frames, self.kernel_root)
            .map_err(|_| ProcessError::OutOfFrames)?;
        taken.root = Some(space.root_page());

        let mapper = &self.mapper;

        // Code.
        let code_start = VirtualAddress::new(USER_CODE_VADDR);
        let code_mapped = &mut taken.code_pages;
        populate(&space, &mut self.frames, code_start, code_pages, code_mapped, |page, index| {
            let chunk = image.code.chunks(PAGE_SIZE as usize).nth(index as usize);
            // SAFETY: the frame was just allocated for this process.
            unsafe { fill_frame(mapper, page, chunk.unwrap_or_default()) };
        })?;

        // User stack.
        let stack_start = VirtualAddress::new(USER_STACK_TOP - stack_pages * PAGE_SIZE);
        taken.stack_start = Some(stack_start);
        let stack_mapped = &mut taken.stack_pages;
        populate(&space, &mut self.frames, stack_start, stack_pages, stack_mapped, |page, _| {
            // SAFETY: as above.
            unsafe { zero_frame(mapper, page) };
        })?;

        // Kernel stack.
        let kernel_pages = pages_for(KERNEL_STACK_SIZE);
        let kernel_pa = self
            .frames
            .allocate(kernel_pages)
            .ok_or(ProcessError::OutOfFrames)?;
        for k in 0..kernel_pages {
            // SAFETY: as above.
            unsafe { zero_frame(mapper, PhysicalPage::from_addr(kernel_pa + k * PAGE_SIZE)) };
        }
        let kernel_stack_start = match KernelSpace::new(mapper, self.kernel_root)
            .map_anywhere(kernel_pa, KERNEL_STACK_SIZE)
        {
            Ok(va) => va,
            Err(e) => {
                let run = FrameRun {
                    base: kernel_pa,
                    count: kernel_pages,
                };
                free_run(&mut self.frames, run);
                return Err(e.into());
            }
        };
        taken.kernel_stack_va = Some(kernel_stack_start);
        let kernel_stack_top = kernel_stack_start + (KERNEL_STACK_SIZE - 4);

        let user_mode = Registers::user_entry(
            code_start + image.entry_offset,
            VirtualAddress::new(USER_INITIAL_ESP),
        );

        Ok(Process {
            pid: Pid(0),
            parent: None,
            root: space.root_page(),
            current: user_mode,
            user_mode,
            code_start,
            code_pages,
            stack_start,
            stack_pages,
            kernel_stack_start,
            kernel_stack_top,
        })
    }

    fn release(&mut self, taken: Resources) {
        if let Some(va) = taken.kernel_stack_va {
            let kernel = KernelSpace::new(&self.mapper, self.kernel_root);
            let pages = pages_for(KERNEL_STACK_SIZE);
            release_pages(kernel.address_space(), &mut self.frames, va, pages);
        }
        if let Some(root) = taken.root {
            let space = AddressSpace::from_root(&self.mapper, root);
            let code_start = VirtualAddress::new(USER_CODE_VADDR);
            release_pages(&space, &mut self.frames, code_start, taken.code_pages);
            if let Some(stack_start) = taken.stack_start {
                release_pages(&space, &mut self.frames, stack_start, taken.stack_pages);
            }
            space.release_user_tables(&mut self.frames);
        }
    }
}

/// Back `pages` user pages from `start`, taking the longest runs of frames
/// the bitmap has and mapping each run right away. `mapped` counts the pages
/// in place, on failure too. `fill` sees every frame with its page index
/// before it is mapped.
fn populate<M: PhysMapper>(
    space: &AddressSpace<'_, M>,
    frames: &mut BitmapFrameAlloc<'_>,
    start: VirtualAddress,
    pages: u32,
    mapped: &mut u32,
    mut fill: impl FnMut(PhysicalPage<Size4K>, u32),
) -> Result<(), ProcessError> {
    let mut run = pages;
    while *mapped < pages {
        run = run.min(pages - *mapped);
        let Some(base) = frames.allocate(run) else {
            if run > 1 {
                run = run.div_ceil(2);
                continue;
            }
            return Err(ProcessError::OutOfFrames);
        };
        for k in 0..run {
            fill(PhysicalPage::from_addr(base + k * PAGE_SIZE), *mapped + k);
        }
        let va = start + *mapped * PAGE_SIZE;
        if let Err(e) = space.map_or_unwind(frames, base, va, run * PAGE_SIZE, true, Privilege::User) {
            free_run(frames, FrameRun { base, count: run });
            return Err(e.into());
        }
        *mapped += run;
    }
    Ok(())
}

/// Unmap `pages` pages from `start` and free the frames behind them, one
/// run at a time.
fn release_pages<M: PhysMapper>(
    space: &AddressSpace<'_, M>,
    frames: &mut BitmapFrameAlloc<'_>,
    start: VirtualAddress,
    pages: u32,
) {
    for (va, run) in FrameRuns::new(space, start, pages) {
        space.unmap(va, run.bytes());
        free_run(frames, run);
    }
}

fn free_run(frames: &mut BitmapFrameAlloc<'_>, run: FrameRun) {
    if let Err(e) = frames.free_contiguous(run.base, run.count) {
        log::error!("cannot return {} frames at {:?}: {e}", run.count, run.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{BootInfo, KernelImage, MULTIBOOT_BOOTLOADER_MAGIC, MemoryMap, MemoryRegion};
    use kernel_info::memory::KERNEL_VIRTUAL_BASE;
    use kernel_vmem::testing::{BumpFrames, SimKernel, SimulatedRam};

    fn dummy(pid: u32) -> Process {
        Process {
            pid: Pid(pid),
            parent: None,
            root: PhysicalPage::from_frame_number(0x200 + pid),
            current: Registers::default(),
            user_mode: Registers::default(),
            code_start: VirtualAddress::new(USER_CODE_VADDR),
            code_pages: 1,
            stack_start: VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE),
            stack_pages: 1,
            kernel_stack_start: VirtualAddress::zero(),
            kernel_stack_top: VirtualAddress::zero(),
        }
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut table = ProcessTable::new();
        let a = table.insert(dummy(1)).unwrap();
        assert_eq!(table.get(a).map(|p| p.pid), Some(Pid(1)));

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());

        // Same slot, new generation.
        let b = table.insert(dummy(2)).unwrap();
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).map(|p| p.pid), Some(Pid(2)));
    }

    #[test]
    fn table_capacity() {
        let mut table = ProcessTable::new();
        for pid in 0..MAX_PROCESSES as u32 {
            assert!(table.insert(dummy(pid)).is_some());
        }
        assert!(table.is_full());
        assert!(table.insert(dummy(99)).is_none());
        assert_eq!(table.iter().count(), MAX_PROCESSES);
    }

    #[test]
    fn scattered_frames_still_make_a_process() {
        let ram = SimulatedRam::new();
        let SimKernel { root, window } =
            SimKernel::boot(&ram, &mut BumpFrames::new(0x0018_0000, 0x0020_0000), 16);
        let info = BootInfo {
            magic: MULTIBOOT_BOOTLOADER_MAGIC,
            memory_map: MemoryMap::from_regions(&[MemoryRegion::new(0x0010_0000, 0x0100_0000)])
                .unwrap(),
            kernel: KernelImage {
                phys_start: 0x0010_0000,
                phys_end: 0x0020_0000,
                virt_start: KERNEL_VIRTUAL_BASE,
                virt_end: KERNEL_VIRTUAL_BASE + 0x0010_0000,
            },
        };
        let mut kernel = Kernel::init(&info, window, root, |_, words| {
            Some(Box::leak(vec![0u32; words].into_boxed_slice()))
        })
        .unwrap();

        // Leave only every other frame free.
        let mut taken = Vec::new();
        while let Some(pa) = kernel.frames.allocate(1) {
            taken.push(pa);
        }
        for pa in taken.iter().step_by(2) {
            kernel.frames.free(*pa).unwrap();
        }
        assert!(kernel.frames.allocate(2).is_none());
        let before = kernel.frames.free_frames();

        let code = vec![0x90u8; 8 * PAGE_SIZE as usize];
        let image = ProcessImage::new(&code).with_stack_pages(3);
        let handle = kernel.create_process(&image, None).unwrap();
        let process = *kernel.process(handle).unwrap();
        assert_eq!((process.code_pages, process.stack_pages), (8, 3));
        // Code, stack, root, two page tables and the kernel stack.
        assert_eq!(kernel.frames.free_frames(), before - 8 - 3 - 1 - 2 - 1);

        {
            let space = kernel.address_space(handle).unwrap();
            let runs: Vec<_> = FrameRuns::new(&space, process.code_start, 8).collect();
            assert_eq!(runs.len(), 8);
            assert!(runs.iter().all(|(_, run)| run.count == 1));
            assert_eq!(runs[3].0, process.code_start + 3 * PAGE_SIZE);
        }

        kernel.destroy_process(handle).unwrap();
        assert_eq!(kernel.frames.free_frames(), before);
    }

    #[test]
    fn contiguous_frames_read_back_as_one_run() {
        let ram = SimulatedRam::new();
        let mut bump = BumpFrames::new(0x0030_0000, 0x0040_0000);
        let SimKernel { root, window } = SimKernel::boot(&ram, &mut bump, 16);
        let space = AddressSpace::create(&window, &mut bump, root).unwrap();
        let start = VirtualAddress::new(USER_CODE_VADDR);
        let base = PhysicalAddress::new(0x0050_0000);
        space
            .map_or_unwind(&mut bump, base, start, 3 * PAGE_SIZE, true, Privilege::User)
            .unwrap();
        let far = PhysicalAddress::new(0x0060_0000);
        space
            .map_or_unwind(&mut bump, far, start + 4 * PAGE_SIZE, PAGE_SIZE, true, Privilege::User)
            .unwrap();

        let runs: Vec<_> = FrameRuns::new(&space, start, 6).collect();
        assert_eq!(
            runs,
            [
                (start, FrameRun { base, count: 3 }),
                (start + 4 * PAGE_SIZE, FrameRun { base: far, count: 1 }),
            ]
        );
    }

    #[test]
    fn image_defaults() {
        let image = ProcessImage::new(&[0x90, 0xEB, 0xFE]).with_entry_offset(1);
        assert_eq!(image.entry_offset, 1);
        assert_eq!(image.stack_pages, USER_STACK_PAGES);
        assert_eq!(Pid(7).to_string(), "pid 7");
    }
}
