//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed 32-bit wrappers for raw memory addresses and page bases used
//! in the i386 paging and memory management code.
//!
//! ## Overview
//!
//! | Type | Generic | Description |
//! |------|---------|-------------|
//! | [`PhysicalAddress`] | – | A physical byte address (frames, page tables). |
//! | [`VirtualAddress`] | – | A page-table translated byte address. |
//! | [`PhysicalPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned physical base. |
//! | [`VirtualPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned virtual base. |
//! | [`PageOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! ## Page Sizes
//!
//! Two-level paging knows two granularities:
//!
//! - [`Size4K`] - 4 KiB pages, the unit of every frame and PTE
//! - [`Size4M`] - the 4 MiB span covered by one page directory entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC040_1000);
//! assert_eq!(page.join(off), va);
//!
//! // The PDE covering the address.
//! assert_eq!(va.page::<Size4M>().base().as_u32(), 0xC040_0000);
//! ```
//!
//! The types are `#[repr(transparent)]`, `Copy`, `Eq`, `Ord` and `Hash`; all
//! alignment math is `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_offset;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_offset::PageOffset;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Number of 4 KiB pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(Size4K::SIZE)
}
