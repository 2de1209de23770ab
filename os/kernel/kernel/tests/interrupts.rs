mod common;

use common::RecordingCpu;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel::cpu::Cpu;
use kernel::interrupts::{InterruptRegistry, PAGE_FAULT_VECTOR, Registers};

fn frame(vector: u32, error_code: u32) -> Registers {
    Registers {
        vector,
        error_code,
        eip: 0x8000_0010,
        ..Registers::default()
    }
}

#[test]
#[should_panic(expected = "halted")]
fn page_faults_halt() {
    let registry = InterruptRegistry::with_defaults();
    let mut cpu = RecordingCpu {
        cr2: 0xDEAD_B000,
        ..RecordingCpu::default()
    };
    registry.dispatch(&mut cpu, &frame(u32::from(PAGE_FAULT_VECTOR), 0b110));
}

#[test]
#[should_panic(expected = "halted")]
fn unhandled_exceptions_halt() {
    let registry = InterruptRegistry::with_defaults();
    registry.dispatch(&mut RecordingCpu::default(), &frame(13, 0x10));
}

#[test]
fn spare_vectors_without_handler_are_ignored() {
    let registry = InterruptRegistry::with_defaults();
    let mut cpu = RecordingCpu::default();
    registry.dispatch(&mut cpu, &frame(0x40, 0));
    assert!(cpu.events.is_empty());
}

static TICKS: AtomicU32 = AtomicU32::new(0);

fn tick(_cpu: &mut dyn Cpu, regs: &Registers) {
    TICKS.fetch_add(regs.vector, Ordering::Relaxed);
}

#[test]
fn registered_handlers_run() {
    let mut registry = InterruptRegistry::new();
    assert!(registry.register(0x20, tick).is_none());
    assert!(registry.register(0x20, tick).is_some());

    let mut cpu = RecordingCpu::default();
    registry.dispatch(&mut cpu, &frame(0x20, 0));
    registry.dispatch(&mut cpu, &frame(0x20, 0));
    assert_eq!(TICKS.load(Ordering::Relaxed), 0x40);
}
