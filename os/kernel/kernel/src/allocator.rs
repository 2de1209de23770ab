//! # Global Allocator
//!
//! [`KernelAllocator`] puts `GlobalAlloc` in front of
//! [`Kernel::kmalloc_aligned`] and [`Kernel::kfree`], so `alloc` collections
//! can live on the kernel heap.
//!
//! The allocator takes the kernel lock with interrupts disabled. Code that
//! already holds that lock must call `kmalloc` directly; allocating through
//! the global allocator from there spins forever.
//!
//! Before the kernel is installed in its slot every allocation fails with a
//! null pointer.

use crate::Kernel;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{Mutex, RawLock, RawUnlock};
use kernel_vmem::PhysMapper;

/// Anything that can serve heap memory to [`KernelAllocator`].
pub trait KernelHeapAccess {
    fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress>;
    fn kfree(&mut self, va: VirtualAddress);
}

impl<M: PhysMapper> KernelHeapAccess for Kernel<'_, M> {
    fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
        Self::kmalloc_aligned(self, size, align)
    }

    fn kfree(&mut self, va: VirtualAddress) {
        Self::kfree(self, va);
    }
}

impl<K: KernelHeapAccess> KernelHeapAccess for Option<K> {
    fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
        self.as_mut()?.kmalloc_aligned(size, align)
    }

    fn kfree(&mut self, va: VirtualAddress) {
        match self.as_mut() {
            Some(kernel) => kernel.kfree(va),
            None => log::error!("dealloc of {va:?} before the kernel is up"),
        }
    }
}

/// `GlobalAlloc` over a kernel kept in a [`Mutex`].
pub struct KernelAllocator<'k, S, R> {
    slot: &'k Mutex<S, R>,
}

impl<'k, S, R> KernelAllocator<'k, S, R> {
    pub const fn new(slot: &'k Mutex<S, R>) -> Self {
        Self { slot }
    }
}

fn request(layout: Layout) -> Option<(u32, u32)> {
    let size = u32::try_from(layout.size().max(1)).ok()?;
    let align = u32::try_from(layout.align()).ok()?;
    Some((size, align))
}

// Kernel pointers are 32 bits wide on the target.
#[allow(clippy::cast_possible_truncation)]
fn address(ptr: *mut u8) -> VirtualAddress {
    VirtualAddress::new(ptr.addr() as u32)
}

fn pointer(va: VirtualAddress) -> *mut u8 {
    ptr::with_exposed_provenance_mut(va.as_usize())
}

// SAFETY: every pointer comes from the kernel heap, which hands out each
// block once, sized and aligned as requested, until it is freed again.
unsafe impl<S, R> GlobalAlloc for KernelAllocator<'_, S, R>
where
    S: KernelHeapAccess,
    R: RawLock + RawUnlock,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((size, align)) = request(layout) else {
            return null_mut();
        };
        self.slot
            .lock_irq()
            .kmalloc_aligned(size, align)
            .map_or(null_mut(), pointer)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.slot.lock_irq().kfree(address(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out ascending addresses and records what was freed.
    #[derive(Default)]
    struct Bump {
        next: u32,
        freed: Vec<VirtualAddress>,
    }

    impl KernelHeapAccess for Bump {
        fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
            let at = (self.next + 0x1000).next_multiple_of(align);
            self.next = at + size;
            Some(VirtualAddress::new(at))
        }

        fn kfree(&mut self, va: VirtualAddress) {
            self.freed.push(va);
        }
    }

    #[test]
    fn layouts_reach_the_heap_and_come_back() {
        let slot = kernel_sync::SpinMutex::new(Some(Bump::default()));
        let allocator = KernelAllocator::new(&slot);

        let layout = Layout::from_size_align(24, 64).unwrap();
        let p = unsafe { allocator.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p.addr() % 64, 0);

        unsafe { allocator.dealloc(p, layout) };
        let freed = slot.lock().as_ref().unwrap().freed.clone();
        assert_eq!(freed, vec![address(p)]);
        assert!(!slot.is_locked());
    }

    #[test]
    fn nothing_before_the_kernel_is_up() {
        let slot = kernel_sync::SpinMutex::new(None::<Bump>);
        let allocator = KernelAllocator::new(&slot);
        let layout = Layout::new::<u64>();
        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }
}
