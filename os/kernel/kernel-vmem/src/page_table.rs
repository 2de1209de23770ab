//! # Two-Level Page Tables
//!
//! A virtual address splits into a page directory index (bits `[31:22]`),
//! a page table index (bits `[21:12]`) and a 12-bit page offset.

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at either level.
pub const ENTRIES: usize = 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

/// Inverse of [`split_indices`] for page-aligned addresses.
#[inline]
#[must_use]
pub const fn join_indices(pd: PdIndex, pt: PtIndex) -> VirtualAddress {
    VirtualAddress::new(((pd.as_usize() as u32) << 22) | ((pt.as_usize() as u32) << 12))
}
