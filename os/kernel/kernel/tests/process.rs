mod common;

use common::boot;
use kernel::{FrameRuns, ProcessError, ProcessImage};
use kernel_info::memory::{MAX_PROCESSES, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::testing::SimulatedRam;

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn code_is_copied_and_mapped_for_ring_3() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let code: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let h = kernel.create_process(&ProcessImage::new(&code), None).unwrap();
    let p = *kernel.process(h).unwrap();
    let space = kernel.address_space(h).unwrap();

    assert_eq!(p.code_pages, 2);
    assert_eq!(p.code_start, va(0x8000_0000));
    for (k, chunk) in (0u32..).zip(code.chunks(PAGE_SIZE as usize)) {
        let pa = space.query(va(0x8000_0000 + k * PAGE_SIZE)).unwrap();
        assert_eq!(ram.read_bytes(pa, chunk.len()), chunk);
    }
    // The tail of the last page is zeroed.
    let tail = space.query(va(0x8000_0000 + 5000)).unwrap();
    assert!(ram.read_bytes(tail, 4096 - 904).iter().all(|b| *b == 0));

    let leaf = space.leaf_entry(va(0x8000_0000)).unwrap().flags();
    assert!(leaf.present() && leaf.writable() && leaf.user_access());
}

#[test]
fn stack_and_registers() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let image = ProcessImage::new(&[0x90; 16])
        .with_entry_offset(4)
        .with_stack_pages(2);
    let h = kernel.create_process(&image, None).unwrap();
    let p = *kernel.process(h).unwrap();
    let space = kernel.address_space(h).unwrap();

    assert_eq!(p.stack_start, va(0xBFFF_E000));
    assert!(space.query(va(0xBFFF_E000)).is_some());
    assert!(space.query(va(0xBFFF_FFFC)).is_some());
    assert!(space.query(va(0xBFFF_D000)).is_none());
    let top = space.query(va(0xBFFF_F000)).unwrap();
    assert!(ram.read_bytes(top, 4096).iter().all(|b| *b == 0));

    let r = p.user_mode;
    assert_eq!(r.eip, 0x8000_0004);
    assert_eq!(r.user_esp, 0xBFFF_FFFC);
    assert_eq!(r.eflags, 0x202);
    assert_eq!(r.cs, 0x1B);
    assert_eq!([r.ss, r.ds, r.es, r.fs, r.gs], [0x23; 5]);
    assert_eq!(p.current, p.user_mode);
}

#[test]
fn kernel_stack_is_shared_kernel_memory() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let a = kernel.create_process(&ProcessImage::new(&[0x90]), None).unwrap();
    let b = kernel.create_process(&ProcessImage::new(&[0x90]), None).unwrap();
    let pa = *kernel.process(a).unwrap();
    let pb = *kernel.process(b).unwrap();

    assert_ne!(pa.kernel_stack_start, pb.kernel_stack_start);
    assert!(pa.kernel_stack_start.as_u32() >= 0xC000_0000);
    assert_eq!(pa.kernel_stack_top, pa.kernel_stack_start + (4096 - 4));

    // Visible from the kernel directory and from both process directories.
    let in_kernel = kernel.kernel_space().query(pa.kernel_stack_start);
    assert!(in_kernel.is_some());
    assert_eq!(kernel.address_space(a).unwrap().query(pa.kernel_stack_start), in_kernel);
    assert_eq!(kernel.address_space(b).unwrap().query(pa.kernel_stack_start), in_kernel);
    let leaf = kernel
        .kernel_space()
        .address_space()
        .leaf_entry(pa.kernel_stack_start)
        .unwrap()
        .flags();
    assert!(leaf.writable() && !leaf.user_access());
}

#[test]
fn pids_increase_and_parents_are_kept() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let a = kernel.create_process(&ProcessImage::new(&[0x90]), None).unwrap();
    let pid_a = kernel.process(a).unwrap().pid;
    let b = kernel.create_process(&ProcessImage::new(&[0x90]), Some(pid_a)).unwrap();
    let pb = *kernel.process(b).unwrap();

    assert!(pb.pid > pid_a);
    assert_eq!(pb.parent, Some(pid_a));
    assert_eq!(kernel.find_process(pb.pid), Some(b));

    // Pids are not reused.
    kernel.destroy_process(b).unwrap();
    let c = kernel.create_process(&ProcessImage::new(&[0x90]), None).unwrap();
    assert!(kernel.process(c).unwrap().pid > pb.pid);
}

#[test]
fn teardown_returns_every_frame() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let before = kernel.frames().free_frames();

    let h = kernel
        .create_process(&ProcessImage::new(&[0x90; 9000]).with_stack_pages(3), None)
        .unwrap();
    let p = *kernel.process(h).unwrap();
    // Directory, two user page tables, code, stack, kernel stack.
    assert_eq!(kernel.frames().free_frames(), before - 1 - 2 - 3 - 3 - 1);
    let code: Vec<_> = {
        let space = kernel.address_space(h).unwrap();
        FrameRuns::new(&space, p.code_start, p.code_pages).collect()
    };
    assert_eq!(code.iter().map(|(_, run)| run.count).sum::<u32>(), 3);

    assert_eq!(kernel.destroy_process(h), Ok(p.pid));
    assert_eq!(kernel.frames().free_frames(), before);
    assert!(kernel.process(h).is_none());
    assert!(kernel.kernel_space().query(p.kernel_stack_start).is_none());
    for (_, run) in &code {
        assert_eq!(kernel.frames().is_free(run.base), Some(true));
    }
    assert_eq!(kernel.frames().is_free(p.root.base()), Some(true));

    assert_eq!(kernel.destroy_process(h), Err(ProcessError::UnknownProcess));
}

#[test]
fn failed_creation_unwinds() {
    let ram = SimulatedRam::new();
    // 256 usable frames.
    let mut kernel = boot(&ram, 0x0020_0000);
    let before = kernel.frames().free_frames();
    let stats = kernel.heap_stats();

    // Directory, code, its table, stack and the stack's table fit; the
    // kernel stack does not.
    let code = vec![0x90u8; ((before - 4) * PAGE_SIZE) as usize];
    let err = kernel.create_process(&ProcessImage::new(&code), None);
    assert_eq!(err, Err(ProcessError::OutOfFrames));

    assert_eq!(kernel.frames().free_frames(), before);
    assert_eq!(kernel.processes().count(), 0);
    assert!(kernel.run_queue().is_empty());
    assert_eq!(kernel.heap_stats(), stats);

    // Everything that was taken can be used again.
    let small = kernel.create_process(&ProcessImage::new(&[0x90]), None);
    assert!(small.is_ok());
}

#[test]
fn code_larger_than_memory_fails_cleanly() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0020_0000);
    let before = kernel.frames().free_frames();

    let code = vec![0x90u8; ((before + 1) * PAGE_SIZE) as usize];
    let err = kernel.create_process(&ProcessImage::new(&code), None);
    assert_eq!(err, Err(ProcessError::OutOfFrames));
    assert_eq!(kernel.frames().free_frames(), before);
}

#[test]
fn bad_images_are_rejected() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let before = kernel.frames().free_frames();

    assert_eq!(
        kernel.create_process(&ProcessImage::new(&[]), None),
        Err(ProcessError::EmptyImage)
    );
    assert_eq!(
        kernel.create_process(&ProcessImage::new(&[0x90; 4]).with_entry_offset(4), None),
        Err(ProcessError::EntryOutOfRange(4))
    );
    assert_eq!(
        kernel.create_process(&ProcessImage::new(&[0x90]).with_stack_pages(0x4_0000), None),
        Err(ProcessError::ImageTooLarge)
    );
    assert_eq!(kernel.frames().free_frames(), before);
}

#[test]
fn process_table_fills_up() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    for _ in 0..MAX_PROCESSES {
        kernel.create_process(&ProcessImage::new(&[0x90]), None).unwrap();
    }
    let before = kernel.frames().free_frames();
    assert_eq!(
        kernel.create_process(&ProcessImage::new(&[0x90]), None),
        Err(ProcessError::TableFull)
    );
    assert_eq!(kernel.frames().free_frames(), before);
    assert_eq!(kernel.run_queue().len(), MAX_PROCESSES);
}
