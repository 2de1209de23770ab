//! # Page Fault Handler (vector 14)
//!
//! Page faults are fatal: there is no demand paging and no swap. The handler
//! decodes the error code, logs a report and halts.

use crate::cpu::Cpu;
use crate::interrupts::{PAGE_FAULT_VECTOR, Registers};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code layout (i386).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            match (self.user(), self.write()) {
                (false, false) => "Supervisory process tried to read a non-present page entry",
                (false, true) => "Supervisory process tried to write to a non-present page entry",
                (true, false) => "User process tried to read a non-present page entry",
                (true, true) => "User process tried to write to a non-present page entry",
            }
        } else if self.instruction_fetch() {
            "Instruction fetch from a protected page"
        } else {
            match (self.user(), self.write()) {
                (false, false) => "Supervisory process tried to read a page and caused a protection fault",
                (false, true) => "Supervisory process tried to write to a page and caused a protection fault",
                (true, false) => "User process tried to read a page and caused a protection fault",
                (true, true) => "User process tried to write to a page and caused a protection fault",
            }
        }
    }
}

/// Everything known about a page fault.
#[derive(Debug, Copy, Clone)]
pub struct PageFaultReport {
    /// `CR2`.
    pub address: VirtualAddress,
    pub error: PageFaultError,
    pub regs: Registers,
}

impl PageFaultReport {
    #[must_use]
    pub const fn new(address: VirtualAddress, regs: &Registers) -> Self {
        Self {
            address,
            error: PageFaultError::from_bits(regs.error_code),
            regs: *regs,
        }
    }
}

impl fmt::Display for PageFaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Unhandled exception - {PAGE_FAULT_VECTOR:#X} : [errno - {:#X}]: {}",
            self.error.into_bits(),
            self.error.explain()
        )?;
        writeln!(f, "Faulting address: {:?}", self.address)?;
        write!(f, "{}", self.regs)
    }
}

/// Log the fault and stop the machine.
pub fn handle_page_fault<C: Cpu + ?Sized>(cpu: &mut C, regs: &Registers) -> ! {
    let report = PageFaultReport::new(cpu.fault_address(), regs);
    log::error!("{report}");
    cpu.halt()
}

/// Registry entry for [`PAGE_FAULT_VECTOR`].
pub fn handler(cpu: &mut dyn Cpu, regs: &Registers) {
    handle_page_fault(cpu, regs)
}
