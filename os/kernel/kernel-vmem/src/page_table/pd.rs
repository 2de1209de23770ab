//! # Page Directory (PD)
//!
//! The root level. An entry either points to a [`PageTable`](super::pt::PageTable)
//! (`PS=0`) or, with `CR4.PSE`, maps a 4 MiB page directly (`PS=1`).
//!
//! This kernel only ever creates table pointers; 4 MiB leaves are decoded so
//! that translation still works on boot-time mappings that use them.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_info::memory::KERNEL_PDT_INDEX;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (virtual address bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// Decoded view of a present PDE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdEntryKind {
    /// `PS=0`: the entry points to a page table.
    NextPageTable(PhysicalPage<Size4K>, PageEntryBits),
    /// `PS=1`: a 4 MiB leaf.
    Leaf4MiB(PhysicalPage<Size4M>, PageEntryBits),
}

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PDT")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PdIndex {
    /// First index of the shared kernel half.
    pub const KERNEL_FIRST: Self = Self(KERNEL_PDT_INDEX as u16);

    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 >= Self::KERNEL_FIRST.0
    }

    /// Indices of the user half, `0..768`.
    pub fn user() -> impl Iterator<Item = Self> {
        (0..Self::KERNEL_FIRST.0).map(Self)
    }

    /// Indices of the kernel half, `768..1024`.
    pub fn kernel() -> impl Iterator<Item = Self> {
        (Self::KERNEL_FIRST.0..ENTRIES as u16).map(Self)
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// Decode a present entry.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }
        if self.0.large_page() {
            let base = self.0.physical_address();
            Some(PdEntryKind::Leaf4MiB(PhysicalPage::from_addr(base), self.0))
        } else {
            Some(PdEntryKind::NextPageTable(self.0.physical_page(), self.0))
        }
    }

    /// The page table this entry points to, if any.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::NextPageTable(pt, _)) => Some(pt),
            _ => None,
        }
    }

    /// A present pointer to the page table in `page` (`PS=0`).
    #[inline]
    #[must_use]
    pub const fn make_next(page: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(page.base());
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// The shared kernel half, `768..1024`.
    #[inline]
    #[must_use]
    pub fn kernel_half(&self) -> &[PdEntry] {
        &self.entries[PdIndex::KERNEL_FIRST.as_usize()..]
    }

    #[inline]
    pub fn kernel_half_mut(&mut self) -> &mut [PdEntry] {
        &mut self.entries[PdIndex::KERNEL_FIRST.as_usize()..]
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> PdIndex {
        PdIndex::from(va)
    }
}
