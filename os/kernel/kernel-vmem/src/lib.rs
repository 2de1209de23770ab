//! # Virtual Memory Support
//!
//! Minimal i386 two-level paging: typed page directory and page table
//! entries, per-process [`AddressSpace`]s, and the [`KernelSpace`] view of
//! the shared kernel half.
//!
//! ## Overview
//!
//! A 32-bit virtual address is translated in two steps:
//!
//! ```text
//!  31        22 21        12 11          0
//! +------------+------------+-------------+
//! |  PD index  |  PT index  |   offset    |
//! +------------+------------+-------------+
//!       |            |
//!       v            v
//!   PageDirectory -> PageTable -> 4 KiB frame
//! ```
//!
//! PDE indices `768..1024` (addresses at or above `0xC000_0000`) form the
//! kernel half. Every address space copies those entries from the kernel's
//! page directory when it is created, so kernel page tables are shared.
//!
//! ## Reaching physical memory
//!
//! The kernel has no direct map. Table frames and process frames are reached
//! through a single reserved page, the [`TemporaryWindow`], which remaps one
//! PTE slot for the duration of a closure. All code in this crate goes
//! through the [`PhysMapper`] trait, which the window implements.
//!
//! ## Frames
//!
//! New page tables come from a [`FrameAlloc`]. The paging layer never
//! decides where frames come from.
//!
//! ## Testing
//!
//! With the `testing` feature (and in this crate's own tests), [`testing`]
//! provides sparse simulated RAM and a window backend over it, so the full
//! paging code runs on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod address_space;
pub mod kernel_space;
mod page_entry_bits;
pub mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod window;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::kernel_space::{KernelSpace, KernelSpaceError};
pub use crate::page_entry_bits::{PageEntryBits, Privilege};
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::window::{TemporaryWindow, WindowBackend};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames **must** be 4 KiB aligned. Their content is undefined;
/// the paging code zeroes what it allocates.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Scoped access to arbitrary physical frames.
///
/// Unlike a direct map, access is bounded by a closure: the frame is only
/// reachable while `f` runs. Implementations are not re-entrant; calling
/// `with_frame` from inside `f` is a programming error.
pub trait PhysMapper {
    /// Run `f` with the frame `page` viewed as a `T`.
    ///
    /// # Safety
    /// - `T` must be at most 4 KiB and valid for any bit pattern (tables,
    ///   byte or word arrays).
    /// - The frame must not be in use as something the caller holds a
    ///   reference to.
    unsafe fn with_frame<T, R>(&self, page: PhysicalPage<Size4K>, f: impl FnOnce(&mut T) -> R)
    -> R;

    /// Drop any cached translation for `va` in the current address space.
    fn invalidate(&self, va: VirtualAddress);
}

/// Fill a frame with zeroes.
///
/// # Safety
/// The frame must not be live memory anyone else relies on.
#[inline]
pub unsafe fn zero_frame<M: PhysMapper>(mapper: &M, page: PhysicalPage<Size4K>) {
    unsafe { mapper.with_frame(page, |f: &mut [u8; 4096]| f.fill(0)) }
}

/// Copy `bytes` to the start of a frame and zero the remainder.
///
/// At most 4 KiB are copied; the rest of `bytes` is ignored.
///
/// # Safety
/// The frame must not be live memory anyone else relies on.
#[inline]
pub unsafe fn fill_frame<M: PhysMapper>(mapper: &M, page: PhysicalPage<Size4K>, bytes: &[u8]) {
    unsafe {
        mapper.with_frame(page, |f: &mut [u8; 4096]| {
            let n = bytes.len().min(f.len());
            f[..n].copy_from_slice(&bytes[..n]);
            f[n..].fill(0);
        });
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` past 4 GiB.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), Some(0));
/// assert_eq!(align_up(1,       4096), Some(4096));
/// assert_eq!(align_up(4097,    4096), Some(8192));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
