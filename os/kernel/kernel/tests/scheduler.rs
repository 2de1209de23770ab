mod common;

use common::{Event, RecordingCpu, boot};
use kernel::interrupts::Registers;
use kernel::selectors::KERNEL_DS;
use kernel::{ProcessError, ProcessImage};
use kernel_vmem::testing::SimulatedRam;

const LOOP: &[u8] = &[0xEB, 0xFE]; // jmp $

#[test]
fn empty_queue_does_nothing() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let mut cpu = RecordingCpu::default();

    assert_eq!(kernel.schedule(&mut cpu, None), None);
    assert!(cpu.events.is_empty());
    assert_eq!(kernel.running(), None);
}

#[test]
fn round_robin_order() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let mut cpu = RecordingCpu::default();

    let handles: Vec<_> = (0..3)
        .map(|_| kernel.create_process(&ProcessImage::new(LOOP), None).unwrap())
        .collect();
    let pids: Vec<_> = handles.iter().map(|h| kernel.process(*h).unwrap().pid).collect();

    let order: Vec<_> = (0..4)
        .map(|_| kernel.schedule(&mut cpu, None).unwrap())
        .collect();
    assert_eq!(order, [pids[0], pids[1], pids[2], pids[0]]);
    assert_eq!(kernel.running(), Some(handles[0]));
}

#[test]
fn switch_programs_the_cpu() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let mut cpu = RecordingCpu::default();

    let h = kernel
        .create_process(&ProcessImage::new(LOOP).with_entry_offset(1), None)
        .unwrap();
    let p = *kernel.process(h).unwrap();
    kernel.schedule(&mut cpu, None).unwrap();

    assert_eq!(
        cpu.events,
        [
            Event::KernelStack(KERNEL_DS, p.kernel_stack_top),
            Event::PageDirectory(p.root),
            Event::Enter(p.user_mode),
        ]
    );
    assert_eq!(p.user_mode.eip, 0x8000_0001);
}

#[test]
fn interrupted_context_is_saved_and_resumed() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let mut cpu = RecordingCpu::default();

    let a = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();
    let b = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();

    kernel.schedule(&mut cpu, None).unwrap();
    let saved = Registers {
        eax: 42,
        eip: 0x8000_0001,
        ..kernel.process(a).unwrap().current
    };
    kernel.schedule(&mut cpu, Some(&saved)).unwrap();
    assert_eq!(kernel.process(a).unwrap().current, saved);
    assert_eq!(kernel.running(), Some(b));

    // B is interrupted with its entry context unchanged, then A resumes.
    let b_regs = kernel.process(b).unwrap().current;
    kernel.schedule(&mut cpu, Some(&b_regs)).unwrap();
    assert_eq!(cpu.entered().last(), Some(&saved));
}

#[test]
fn running_process_cannot_be_destroyed() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);
    let mut cpu = RecordingCpu::default();

    let a = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();
    let b = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();
    let c = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();
    let pid_a = kernel.schedule(&mut cpu, None).unwrap();

    assert_eq!(kernel.destroy_process(a), Err(ProcessError::Running(pid_a)));

    // Destroying B takes it out of the rotation.
    kernel.destroy_process(b).unwrap();
    let pid_c = kernel.process(c).unwrap().pid;
    assert_eq!(kernel.run_queue().len(), 2);
    assert_eq!(kernel.schedule(&mut cpu, None), Some(pid_c));
    assert_eq!(kernel.schedule(&mut cpu, None), Some(pid_a));

    // Once C is current, A can go.
    assert_eq!(kernel.schedule(&mut cpu, None), Some(pid_c));
    assert_eq!(kernel.destroy_process(a), Ok(pid_a));
    assert_eq!(kernel.run_queue().iter().collect::<Vec<_>>(), [c]);
}

#[test]
fn enqueue_rejects_duplicates_and_stale_handles() {
    let ram = SimulatedRam::new();
    let mut kernel = boot(&ram, 0x0100_0000);

    let a = kernel.create_process(&ProcessImage::new(LOOP), None).unwrap();
    assert!(!kernel.enqueue(a));
    kernel.destroy_process(a).unwrap();
    assert!(!kernel.enqueue(a));
    assert!(kernel.run_queue().is_empty());
}
