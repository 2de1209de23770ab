//! TLB maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation for the page containing `va`.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

/// Flush all non-global translations by reloading CR3 with its current value.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn flush_all() {
    use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe, cr3::Cr3};
    unsafe {
        Cr3::load_unsafe().store_unsafe();
    }
}

/// No paging hardware to maintain when built for another target.
///
/// # Safety
/// Always safe; kept `unsafe` to match the hardware signature.
#[cfg(not(all(feature = "asm", target_arch = "x86")))]
#[inline]
pub const unsafe fn invalidate_page(_va: VirtualAddress) {}
