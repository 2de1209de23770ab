mod common;

use common::boot;
use core::alloc::{GlobalAlloc, Layout};
use kernel::KernelAllocator;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinMutex;
use kernel_vmem::testing::SimulatedRam;

#[test]
fn small_allocations_are_distinct_kernel_memory() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let a = kernel.kmalloc(8).unwrap();
    let b = kernel.kmalloc(8).unwrap();
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    assert!(hi.as_u32() - lo.as_u32() >= 8);
    assert_eq!(a.as_u32() % 8, 0);
    assert_eq!(b.as_u32() % 8, 0);

    let space = kernel.kernel_space();
    for va in [a, b] {
        assert!(space.query(va).is_some());
        let leaf = space.address_space().leaf_entry(va).unwrap().flags();
        assert!(leaf.writable());
        assert!(!leaf.user_access());
    }
}

#[test]
fn freed_memory_is_reused() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let initial = kernel.heap_stats();

    let a = kernel.kmalloc(100).unwrap();
    let b = kernel.kmalloc(100).unwrap();
    assert_eq!(kernel.heap_stats().live_allocations, 2);

    kernel.kfree(a);
    kernel.kfree(b);
    let after = kernel.heap_stats();
    assert_eq!(after.live_allocations, 0);
    assert_eq!(after.free_bytes, initial.free_bytes);
    assert_eq!(after.free_blocks, 1);

    // The coalesced block serves a request spanning both.
    assert!(kernel.kmalloc(200).is_some());
    assert_eq!(kernel.heap_stats().committed, initial.committed);
}

#[test]
fn aligned_requests() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    kernel.kmalloc(24).unwrap();
    let page = kernel.kmalloc_aligned(64, 4096).unwrap();
    assert_eq!(page.as_u32() % 4096, 0);
    kernel.kfree(page);
}

#[test]
#[should_panic(expected = "kfree")]
fn freeing_a_foreign_pointer_panics() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let a = kernel.kmalloc(32).unwrap();
    kernel.kfree(a + 8);
}

#[test]
fn thousands_of_small_allocations_stay_live() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let frames_before = kernel.frames().free_frames();

    let live: Vec<_> = (0..5000).map(|_| kernel.kmalloc(8).unwrap()).collect();
    let stats = kernel.heap_stats();
    assert_eq!(stats.live_allocations, 5000);
    // Header and payload take two units each, more than the initial heap.
    assert!(stats.committed > 5000 * 16 - 1);
    assert!(kernel.frames().free_frames() < frames_before);

    let mut sorted = live.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), live.len());
    assert!(sorted.windows(2).all(|w| w[1].as_u32() - w[0].as_u32() >= 16));
    assert_eq!(kernel.allocation_size(live[1234]), Some(8));

    for va in live {
        kernel.kfree(va);
    }
    assert_eq!(kernel.heap_stats().live_allocations, 0);
    assert_eq!(kernel.heap_stats().used_bytes, 0);
}

#[test]
fn global_alloc_serves_from_the_kernel_heap() {
    let ram = SimulatedRam::new();
    let slot = SpinMutex::new(Some(boot(&ram, 0x0100_0000)));
    let allocator = KernelAllocator::new(&slot);

    let layout = Layout::from_size_align(100, 16).unwrap();
    let p = unsafe { allocator.alloc(layout) };
    assert!(!p.is_null());
    assert_eq!(p.addr() % 16, 0);

    let va = VirtualAddress::new(u32::try_from(p.addr()).unwrap());
    {
        let guard = slot.lock();
        let kernel = guard.as_ref().unwrap();
        assert!(kernel.kernel_space().query(va).is_some());
        assert_eq!(kernel.allocation_size(va), Some(104));
        assert_eq!(kernel.heap_stats().live_allocations, 1);
    }

    unsafe { allocator.dealloc(p, layout) };
    assert_eq!(slot.lock().as_ref().unwrap().heap_stats().live_allocations, 0);
}
