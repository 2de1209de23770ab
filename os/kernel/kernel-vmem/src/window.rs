//! # Temporary Mapping Window
//!
//! One reserved PTE slot in the kernel page table that also maps the kernel
//! image. [`TemporaryWindow::with_frame`] points the slot at an arbitrary
//! frame, runs a closure against it and puts the previous entry back.
//!
//! Restoration happens in a drop guard, so it also runs on early return and
//! during unwinding. The window is not re-entrant: opening it while it is
//! already open panics.

use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::{PageEntryBits, PhysMapper};
use core::cell::Cell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// What differs between the real machine and a simulation: how a window
/// address becomes a pointer, and how stale translations are dropped.
pub trait WindowBackend {
    /// Pointer through which the frame mapped by `pte` is reachable once
    /// `pte` is installed at `va`.
    ///
    /// On hardware this is simply `va`.
    fn window_ptr(&self, va: VirtualAddress, pte: PtEntry) -> *mut u8;

    /// `invlpg` for `va`.
    fn invalidate(&self, va: VirtualAddress);
}

pub struct TemporaryWindow<B: WindowBackend> {
    /// The kernel page table holding the slot, at an address that stays
    /// valid for the window's lifetime.
    table: NonNull<PageTable>,
    va: VirtualAddress,
    busy: Cell<bool>,
    backend: B,
}

/// Puts the saved entry back and releases the window.
struct Restore<'w, B: WindowBackend> {
    window: &'w TemporaryWindow<B>,
    saved: PtEntry,
}

impl<B: WindowBackend> Drop for Restore<'_, B> {
    fn drop(&mut self) {
        // SAFETY: `table` is valid for the window's lifetime, see `new`.
        unsafe { self.window.write_slot(self.saved) };
        self.window.backend.invalidate(self.window.va);
        self.window.busy.set(false);
    }
}

impl<B: WindowBackend> TemporaryWindow<B> {
    /// # Safety
    /// - `table` must point to the page table that translates `va` in every
    ///   address space the window is used from, and stay valid and
    ///   writable for the lifetime of the window.
    /// - Nothing else may use the PTE slot of `va`.
    pub const unsafe fn new(table: NonNull<PageTable>, va: VirtualAddress, backend: B) -> Self {
        Self {
            table,
            va,
            busy: Cell::new(false),
            backend,
        }
    }

    /// Virtual address of the window slot.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.va
    }

    #[inline]
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether a frame is currently mapped through the window.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.busy.get()
    }

    /// Entry currently in the slot.
    #[must_use]
    pub fn slot(&self) -> PtEntry {
        // SAFETY: see `new`.
        unsafe { self.read_slot() }
    }

    unsafe fn read_slot(&self) -> PtEntry {
        let idx = PtIndex::from(self.va);
        unsafe { (*self.table.as_ptr()).get(idx) }
    }

    unsafe fn write_slot(&self, e: PtEntry) {
        let idx = PtIndex::from(self.va);
        unsafe { (*self.table.as_ptr()).set(idx, e) }
    }
}

impl<B: WindowBackend> PhysMapper for TemporaryWindow<B> {
    /// # Panics
    /// If the window is already open.
    unsafe fn with_frame<T, R>(&self, page: PhysicalPage<Size4K>, f: impl FnOnce(&mut T) -> R) -> R {
        assert!(!self.busy.replace(true), "temporary window is already in use");

        let pte = PtEntry::make_4k(page, PageEntryBits::new_kernel_rw());
        let saved = unsafe { self.read_slot() };
        unsafe { self.write_slot(pte) };
        self.backend.invalidate(self.va);
        let _restore = Restore {
            window: self,
            saved,
        };

        let ptr = self.backend.window_ptr(self.va, pte).cast::<T>();
        f(unsafe { &mut *ptr })
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.backend.invalidate(va);
    }
}
