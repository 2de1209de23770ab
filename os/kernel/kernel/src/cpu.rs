//! The hardware actions the scheduler and fault handlers need.
//!
//! Everything above this trait is plain data manipulation and runs on the
//! host. [`crate::arch`] implements it with real instructions.

use crate::interrupts::Registers;
use crate::selectors::SegmentSelector;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

pub trait Cpu {
    /// Program the TSS with the stack used on the next ring 0 entry.
    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: VirtualAddress);

    /// Install `root` as the active page directory (`CR3`).
    fn load_page_directory(&mut self, root: PhysicalPage<Size4K>);

    /// Resume execution with `regs`, dropping to the privilege level of
    /// `regs.cs`. On hardware this does not return.
    fn enter(&mut self, regs: &Registers);

    /// Stop the machine.
    fn halt(&mut self) -> !;

    /// Linear address of the last page fault (`CR2`).
    fn fault_address(&self) -> VirtualAddress;
}
