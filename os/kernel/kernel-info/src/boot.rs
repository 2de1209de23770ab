//! # Kernel Boot Information
//!
//! What a multiboot-compliant loader tells the kernel, reduced to the parts the
//! memory core consumes: the magic value, the physical memory map and the
//! bounds of the kernel image.

use crate::memory::{LOW_MEMORY_END, MAX_MEMORY_REGIONS, PAGE_SIZE};

/// Value a multiboot loader leaves in `EAX` when handing over control.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Multiboot memory map type tag for usable RAM.
pub const MULTIBOOT_MEMORY_AVAILABLE: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("bad multiboot magic {0:#010x}")]
    BadMagic(u32),
    #[error("too many memory map regions")]
    TooManyRegions,
    #[error("no usable memory reported")]
    NoMemory,
}

/// One entry of the loader's memory map, as laid out by multiboot.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct MultibootMmapEntry {
    /// Size of the rest of the entry (excluding this field).
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    /// `1` for available RAM, anything else is reserved.
    pub kind: u32,
}

/// A contiguous physical region `[base, base + length)`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u32,
    pub length: u32,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u32, length: u32) -> Self {
        Self { base, length }
    }

    /// Exclusive end; may be exactly 4 GiB, hence `u64`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base as u64 + self.length as u64
    }

    /// Number of whole 4 KiB frames in the region.
    #[must_use]
    pub const fn frames(&self) -> u32 {
        self.length / PAGE_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Fixed-capacity list of memory regions, kept in the order reported.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    len: usize,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: [MemoryRegion::new(0, 0); MAX_MEMORY_REGIONS],
            len: 0,
        }
    }

    /// Build from a slice of regions.
    ///
    /// # Errors
    /// [`BootError::TooManyRegions`] if the slice exceeds the capacity.
    pub fn from_regions(regions: &[MemoryRegion]) -> Result<Self, BootError> {
        let mut map = Self::new();
        for r in regions {
            map.push(*r)?;
        }
        Ok(map)
    }

    /// Collect the available entries of a multiboot memory map.
    ///
    /// Memory above 4 GiB is unreachable without PAE and is clipped.
    ///
    /// # Errors
    /// [`BootError::TooManyRegions`] if more available entries than fit are reported.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_multiboot<I>(entries: I) -> Result<Self, BootError>
    where
        I: IntoIterator<Item = MultibootMmapEntry>,
    {
        const FOUR_GIB: u64 = 1 << 32;
        let mut map = Self::new();
        for e in entries {
            let (kind, base, length) = (e.kind, e.base_addr, e.length);
            if kind != MULTIBOOT_MEMORY_AVAILABLE || base >= FOUR_GIB {
                continue;
            }
            let end = base.saturating_add(length).min(FOUR_GIB - 1);
            map.push(MemoryRegion::new(base as u32, (end - base) as u32))?;
        }
        Ok(map)
    }

    /// Append a region; empty regions are dropped.
    ///
    /// # Errors
    /// [`BootError::TooManyRegions`] when full.
    pub fn push(&mut self, region: MemoryRegion) -> Result<(), BootError> {
        if region.is_empty() {
            return Ok(());
        }
        let slot = self
            .regions
            .get_mut(self.len)
            .ok_or(BootError::TooManyRegions)?;
        *slot = region;
        self.len += 1;
        Ok(())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[MemoryRegion] {
        &self.regions[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.as_slice().iter()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of whole frames across all regions.
    #[must_use]
    pub fn total_frames(&self) -> u32 {
        self.iter().map(MemoryRegion::frames).sum()
    }

    /// The regions the frame allocator may manage.
    ///
    /// Each region is shrunk to whole frames, everything below 1 MiB is
    /// dropped and the kernel image is cut out (splitting a region if the
    /// image sits in its middle).
    ///
    /// # Errors
    /// [`BootError::TooManyRegions`] if splitting overflows the capacity,
    /// [`BootError::NoMemory`] if nothing usable remains.
    #[allow(clippy::cast_possible_truncation)]
    pub fn usable_regions(&self, kernel: &KernelImage) -> Result<Self, BootError> {
        let page = u64::from(PAGE_SIZE);
        let k_start = u64::from(kernel.phys_start) & !(page - 1);
        let k_end = u64::from(kernel.phys_end).div_ceil(page) * page;

        let mut out = Self::new();
        for r in self.iter() {
            let start = u64::from(r.base).max(u64::from(LOW_MEMORY_END)).div_ceil(page) * page;
            let end = r.end() & !(page - 1);
            if start >= end {
                continue;
            }

            // The part below the kernel image, then the part above it.
            let pieces = [(start, end.min(k_start)), (start.max(k_end), end)];
            for (lo, hi) in pieces {
                if lo < hi {
                    out.push(MemoryRegion::new(lo as u32, (hi - lo) as u32))?;
                }
            }
        }

        if out.is_empty() {
            return Err(BootError::NoMemory);
        }
        Ok(out)
    }
}

/// Where the kernel image was loaded and linked.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct KernelImage {
    pub phys_start: u32,
    pub phys_end: u32,
    pub virt_start: u32,
    pub virt_end: u32,
}

/// Everything the memory core needs from the loader.
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// The value found in `EAX` on entry.
    pub magic: u32,
    pub memory_map: MemoryMap,
    pub kernel: KernelImage,
}

impl BootInfo {
    /// Reject boot data that was not produced by a multiboot loader.
    ///
    /// # Errors
    /// [`BootError::BadMagic`] on mismatch.
    pub const fn validate(&self) -> Result<(), BootError> {
        if self.magic == MULTIBOOT_BOOTLOADER_MAGIC {
            Ok(())
        } else {
            Err(BootError::BadMagic(self.magic))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_at_1m() -> KernelImage {
        KernelImage {
            phys_start: 0x0010_0000,
            phys_end: 0x0012_3456,
            virt_start: 0xC010_0000,
            virt_end: 0xC012_3456,
        }
    }

    #[test]
    fn magic_is_checked() {
        let mut info = BootInfo {
            magic: MULTIBOOT_BOOTLOADER_MAGIC,
            memory_map: MemoryMap::new(),
            kernel: kernel_at_1m(),
        };
        assert!(info.validate().is_ok());
        info.magic = 0xDEAD_BEEF;
        assert_eq!(info.validate(), Err(BootError::BadMagic(0xDEAD_BEEF)));
    }

    #[test]
    fn usable_regions_drop_low_memory_and_kernel() {
        let map = MemoryMap::from_regions(&[
            MemoryRegion::new(0, 0x0009_FC00),
            MemoryRegion::new(0x0010_0000, 0x07F0_0000),
        ])
        .unwrap();

        let usable = map.usable_regions(&kernel_at_1m()).unwrap();
        assert_eq!(usable.as_slice(), &[MemoryRegion::new(0x0012_4000, 0x07EDC000)]);
    }

    #[test]
    fn kernel_in_the_middle_splits_a_region() {
        let map = MemoryMap::from_regions(&[MemoryRegion::new(0x0010_0000, 0x0100_0000)]).unwrap();
        let kernel = KernelImage {
            phys_start: 0x0040_0000,
            phys_end: 0x0050_0000,
            ..KernelImage::default()
        };
        let usable = map.usable_regions(&kernel).unwrap();
        assert_eq!(
            usable.as_slice(),
            &[
                MemoryRegion::new(0x0010_0000, 0x0030_0000),
                MemoryRegion::new(0x0050_0000, 0x00C0_0000),
            ]
        );
    }

    #[test]
    fn unaligned_regions_shrink_to_whole_frames() {
        let map = MemoryMap::from_regions(&[MemoryRegion::new(0x0020_0010, 0x2000)]).unwrap();
        let usable = map.usable_regions(&KernelImage::default()).unwrap();
        assert_eq!(usable.as_slice(), &[MemoryRegion::new(0x0020_1000, 0x1000)]);
    }

    #[test]
    fn nothing_usable_is_an_error() {
        let map = MemoryMap::from_regions(&[MemoryRegion::new(0, 0x0009_F000)]).unwrap();
        assert_eq!(
            map.usable_regions(&kernel_at_1m()).unwrap_err(),
            BootError::NoMemory
        );
    }

    #[test]
    fn multiboot_entries_keep_only_available_ram() {
        let entries = [
            MultibootMmapEntry {
                size: 20,
                base_addr: 0,
                length: 0x9_FC00,
                kind: MULTIBOOT_MEMORY_AVAILABLE,
            },
            MultibootMmapEntry {
                size: 20,
                base_addr: 0xF_0000,
                length: 0x1_0000,
                kind: 2,
            },
            MultibootMmapEntry {
                size: 20,
                base_addr: 0x10_0000,
                length: 0x1FF0_0000,
                kind: MULTIBOOT_MEMORY_AVAILABLE,
            },
            MultibootMmapEntry {
                size: 20,
                base_addr: 0x1_0000_0000,
                length: 0x1000_0000,
                kind: MULTIBOOT_MEMORY_AVAILABLE,
            },
        ];
        let map = MemoryMap::from_multiboot(entries).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.as_slice()[1], MemoryRegion::new(0x10_0000, 0x1FF0_0000));
        assert_eq!(map.total_frames(), 0x9F + 0x1FF00);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut map = MemoryMap::new();
        for i in 1..=MAX_MEMORY_REGIONS as u32 {
            map.push(MemoryRegion::new(i * 0x0100_0000, PAGE_SIZE)).unwrap();
        }
        assert_eq!(
            map.push(MemoryRegion::new(0xF000_0000, PAGE_SIZE)),
            Err(BootError::TooManyRegions)
        );
    }
}
