//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, **1 = free**, 0 = used. Bits past the last
//! tracked frame are 0 and therefore never handed out.
//!
//! The bit index space is the concatenation of the usable memory regions in
//! the order they were reported:
//!
//! ```text
//!  region 0 (n0 frames)   region 1 (n1 frames)    padding
//! [0 ........... n0-1][n0 ........ n0+n1-1][ 0 0 0 ]
//! ```
//!
//! The bitmap itself lives in frames taken from the head of the first region
//! large enough to hold it. Where it becomes addressable is up to the caller,
//! which maps it and hands back a slice during [`BitmapFrameAlloc::init`].

use kernel_info::boot::{MemoryMap, MemoryRegion};
use kernel_info::memory::{MAX_MEMORY_REGIONS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, pages_for};
use kernel_vmem::FrameAlloc;

const BITS: u32 = u32::BITS;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("the memory map contains no frames")]
    NoMemory,
    #[error("no region can hold a bitmap of {0} frames")]
    NoRoomForBitmap(u32),
    #[error("bitmap storage could not be provided")]
    Storage,
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("{0:?} is not frame aligned")]
    Misaligned(PhysicalAddress),
    #[error("{0:?} is not tracked by the frame allocator")]
    Untracked(PhysicalAddress),
    #[error("{0:?} holds the frame bitmap")]
    Bitmap(PhysicalAddress),
}

/// A memory region and where its frames start in the bitmap.
#[derive(Debug, Copy, Clone, Default)]
struct Tracked {
    base: u32,
    frames: u32,
    first_bit: u32,
}

impl Tracked {
    const fn contains_bit(&self, bit: u32) -> bool {
        bit >= self.first_bit && bit - self.first_bit < self.frames
    }
}

pub struct BitmapFrameAlloc<'b> {
    bitmap: &'b mut [u32],
    regions: [Tracked; MAX_MEMORY_REGIONS],
    region_count: usize,
    total: u32,
    free: u32,
    /// First bitmap frame and how many frames it spans.
    home: (PhysicalPage<Size4K>, u32),
    home_bit: u32,
}

impl<'b> BitmapFrameAlloc<'b> {
    /// Build the allocator over `regions`.
    ///
    /// `storage` receives the first physical frame reserved for the bitmap,
    /// the number of reserved frames and the number of `u32` words needed,
    /// and returns the words, addressable for `'b`.
    ///
    /// Every frame starts out free except those holding the bitmap.
    ///
    /// # Errors
    /// - [`FrameAllocError::NoMemory`] for an empty map.
    /// - [`FrameAllocError::NoRoomForBitmap`] if no single region fits the bitmap.
    /// - [`FrameAllocError::Storage`] if `storage` fails or returns too few words.
    pub fn init<F>(regions: &MemoryMap, storage: F) -> Result<Self, FrameAllocError>
    where
        F: FnOnce(PhysicalPage<Size4K>, u32, usize) -> Option<&'b mut [u32]>,
    {
        let mut tracked = [Tracked::default(); MAX_MEMORY_REGIONS];
        let mut total = 0u32;
        let mut count = 0;
        for (slot, r) in tracked.iter_mut().zip(regions.iter().filter(|r| r.frames() > 0)) {
            *slot = Tracked {
                base: r.base.next_multiple_of(PAGE_SIZE),
                frames: whole_frames(r),
                first_bit: total,
            };
            total += slot.frames;
            count += 1;
        }
        if total == 0 {
            return Err(FrameAllocError::NoMemory);
        }

        let words = total.div_ceil(BITS) as usize;
        let bitmap_frames = pages_for(u32::try_from(words * 4).map_err(|_| FrameAllocError::NoMemory)?);
        let home = tracked[..count]
            .iter()
            .find(|t| t.frames >= bitmap_frames)
            .ok_or(FrameAllocError::NoRoomForBitmap(bitmap_frames))?;
        let home_page = PhysicalPage::from_addr(PhysicalAddress::new(home.base));
        let home_bit = home.first_bit;

        let bitmap = storage(home_page, bitmap_frames, words).ok_or(FrameAllocError::Storage)?;
        if bitmap.len() < words {
            return Err(FrameAllocError::Storage);
        }
        let bitmap = &mut bitmap[..words];

        // Everything free, padding used.
        bitmap.fill(u32::MAX);
        let tail = total % BITS;
        if tail != 0 {
            bitmap[words - 1] = (1 << tail) - 1;
        }

        let mut this = Self {
            bitmap,
            regions: tracked,
            region_count: count,
            total,
            free: total,
            home: (home_page, bitmap_frames),
            home_bit,
        };
        this.mark_used(home_bit, bitmap_frames);

        log::info!(
            "frame allocator: {total} frames in {count} regions, bitmap at {:?} ({bitmap_frames} frames)",
            home_page
        );
        Ok(this)
    }

    fn regions(&self) -> &[Tracked] {
        &self.regions[..self.region_count]
    }

    #[inline]
    fn is_free_bit(&self, bit: u32) -> bool {
        self.bitmap[(bit / BITS) as usize] & (1 << (bit % BITS)) != 0
    }

    fn mark_used(&mut self, first: u32, n: u32) {
        for bit in first..first + n {
            self.bitmap[(bit / BITS) as usize] &= !(1 << (bit % BITS));
        }
        self.free -= n;
    }

    /// Bit index of the frame at `pa`.
    fn locate(&self, pa: PhysicalAddress) -> Result<u32, FrameAllocError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FrameAllocError::Misaligned(pa));
        }
        let a = pa.as_u32();
        self.regions()
            .iter()
            .find(|t| a >= t.base && (a - t.base) / PAGE_SIZE < t.frames)
            .map(|t| t.first_bit + (a - t.base) / PAGE_SIZE)
            .ok_or(FrameAllocError::Untracked(pa))
    }

    fn address_of(t: &Tracked, bit: u32) -> PhysicalAddress {
        PhysicalAddress::new(t.base + (bit - t.first_bit) * PAGE_SIZE)
    }

    /// Base of `n` contiguous free frames within a single region, marked used.
    ///
    /// First fit by ascending bit index. `None` when no region has a long
    /// enough run, or for `n == 0`.
    pub fn allocate(&mut self, n: u32) -> Option<PhysicalAddress> {
        if n == 0 || n > self.free {
            return None;
        }
        let found = self
            .regions()
            .iter()
            .find_map(|t| self.find_run(t, n).map(|bit| (*t, bit)));
        let Some((t, bit)) = found else {
            log::debug!("no run of {n} free frames");
            return None;
        };
        self.mark_used(bit, n);
        let pa = Self::address_of(&t, bit);
        log::trace!("allocated {n} frames at {pa:?}");
        Some(pa)
    }

    /// First bit of a run of `n` free bits inside `t`.
    fn find_run(&self, t: &Tracked, n: u32) -> Option<u32> {
        if t.frames < n {
            return None;
        }
        let end = t.first_bit + t.frames;
        let mut bit = t.first_bit;
        let mut run_start = bit;
        let mut run = 0;
        while bit < end {
            if bit % BITS == 0 && bit + BITS <= end {
                match self.bitmap[(bit / BITS) as usize] {
                    0 => {
                        run = 0;
                        bit += BITS;
                        continue;
                    }
                    u32::MAX if run + BITS <= n => {
                        if run == 0 {
                            run_start = bit;
                        }
                        run += BITS;
                        bit += BITS;
                        if run == n {
                            return Some(run_start);
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            if self.is_free_bit(bit) {
                if run == 0 {
                    run_start = bit;
                }
                run += 1;
                if run == n {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
            bit += 1;
        }
        None
    }

    /// Return one frame.
    ///
    /// Freeing a frame that is already free is logged and ignored.
    ///
    /// # Errors
    /// [`FrameAllocError::Misaligned`] or [`FrameAllocError::Untracked`], and
    /// [`FrameAllocError::Bitmap`] for the frames holding the bitmap itself;
    /// the bitmap is left unchanged.
    pub fn free(&mut self, pa: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.free_contiguous(pa, 1)
    }

    /// Return `n` frames starting at `pa`.
    ///
    /// # Errors
    /// As [`free`](Self::free), also when the run leaves its region. Nothing
    /// is freed in that case.
    pub fn free_contiguous(&mut self, pa: PhysicalAddress, n: u32) -> Result<(), FrameAllocError> {
        if n == 0 {
            return Ok(());
        }
        let first = self.locate(pa).inspect_err(|e| log::warn!("free: {e}"))?;
        let Some(t) = self.regions().iter().find(|t| t.contains_bit(first)).copied() else {
            return Err(FrameAllocError::Untracked(pa));
        };
        if !t.contains_bit(first + (n - 1)) {
            let last = Self::address_of(&t, t.first_bit + t.frames - 1) + PAGE_SIZE;
            log::warn!("free: {n} frames at {pa:?} run past {last:?}");
            return Err(FrameAllocError::Untracked(last));
        }
        let (home_page, home_frames) = self.home;
        if first < self.home_bit + home_frames && self.home_bit < first + n {
            let hit = home_page.base() + (first.max(self.home_bit) - self.home_bit) * PAGE_SIZE;
            log::warn!("free: {n} frames at {pa:?} cover the bitmap");
            return Err(FrameAllocError::Bitmap(hit));
        }

        for bit in first..first + n {
            if self.is_free_bit(bit) {
                log::warn!("free: frame {:?} is already free", Self::address_of(&t, bit));
                continue;
            }
            self.bitmap[(bit / BITS) as usize] |= 1 << (bit % BITS);
            self.free += 1;
        }
        Ok(())
    }

    /// Whether the frame at `pa` is free, or `None` if it is not tracked.
    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> Option<bool> {
        self.locate(pa).ok().map(|bit| self.is_free_bit(bit))
    }

    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total
    }

    /// Where the bitmap itself lives: first frame and frame count.
    #[must_use]
    pub const fn bitmap_frames(&self) -> (PhysicalPage<Size4K>, u32) {
        self.home
    }
}

const fn whole_frames(r: &MemoryRegion) -> u32 {
    let start = r.base.next_multiple_of(PAGE_SIZE) as u64;
    let end = r.end() & !(PAGE_SIZE as u64 - 1);
    if end > start {
        ((end - start) / PAGE_SIZE as u64) as u32
    } else {
        0
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate(1).map(PhysicalPage::from_addr)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        // Already logged; the bitmap is unchanged on error.
        let _ = self.free(page.base());
    }
}
