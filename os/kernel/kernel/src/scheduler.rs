//! # Round-Robin Scheduler
//!
//! Runnable processes wait in a FIFO [`RunQueue`]. A switch activates the
//! head and moves it to the tail, so `[A, B, C]` runs A, B, C, A, ...
//! There are no priorities and no timer: the kernel calls
//! [`Kernel::schedule`] when it wants to hand the CPU over.
//!
//! Choosing the next process and loading it onto the CPU are separate
//! steps. [`Kernel::pick_next`] only updates bookkeeping and returns a
//! [`Switch`]; [`Switch::activate`] programs the TSS, `CR3` and enters the
//! saved context. On hardware the second step runs after the kernel lock
//! has been released, since entering a process does not come back.

use crate::context::Kernel;
use crate::cpu::Cpu;
use crate::interrupts::Registers;
use crate::process::{Pid, ProcessHandle};
use crate::selectors::KERNEL_DS;
use kernel_info::memory::MAX_PROCESSES;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::PhysMapper;

/// Fixed ring of process handles without duplicates.
pub struct RunQueue {
    ring: [Option<ProcessHandle>; MAX_PROCESSES],
    head: usize,
    len: usize,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: [None; MAX_PROCESSES],
            head: 0,
            len: 0,
        }
    }

    const fn slot(&self, i: usize) -> usize {
        (self.head + i) % MAX_PROCESSES
    }

    /// Append `handle`. Returns `false` if it is already queued or the
    /// queue is full.
    pub fn push_back(&mut self, handle: ProcessHandle) -> bool {
        if self.len == MAX_PROCESSES || self.contains(handle) {
            return false;
        }
        let tail = self.slot(self.len);
        self.ring[tail] = Some(handle);
        self.len += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<ProcessHandle> {
        if self.len == 0 {
            return None;
        }
        let handle = self.ring[self.head].take();
        self.head = self.slot(1);
        self.len -= 1;
        handle
    }

    #[must_use]
    pub const fn front(&self) -> Option<ProcessHandle> {
        if self.len == 0 { None } else { self.ring[self.head] }
    }

    /// Move the head to the tail.
    pub fn rotate(&mut self) {
        if let Some(handle) = self.pop_front() {
            self.push_back(handle);
        }
    }

    /// Drop `handle` from the queue, keeping the order of the rest.
    pub fn remove(&mut self, handle: ProcessHandle) -> bool {
        let Some(pos) = self.iter().position(|h| h == handle) else {
            return false;
        };
        for i in pos..self.len - 1 {
            let (to, from) = (self.slot(i), self.slot(i + 1));
            self.ring[to] = self.ring[from];
        }
        let last = self.slot(self.len - 1);
        self.ring[last] = None;
        self.len -= 1;
        true
    }

    #[must_use]
    pub fn contains(&self, handle: ProcessHandle) -> bool {
        self.iter().any(|h| h == handle)
    }

    /// Handles from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        (0..self.len).filter_map(|i| self.ring[self.slot(i)])
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Everything needed to put a process on the CPU.
#[derive(Debug, Copy, Clone)]
pub struct Switch {
    pub pid: Pid,
    pub root: PhysicalPage<Size4K>,
    pub kernel_stack_top: VirtualAddress,
    pub regs: Registers,
}

impl Switch {
    /// Load the process onto `cpu`: ring 0 stack, page directory, then the
    /// saved context.
    pub fn activate<C: Cpu + ?Sized>(&self, cpu: &mut C) {
        cpu.set_kernel_stack(KERNEL_DS, self.kernel_stack_top);
        cpu.load_page_directory(self.root);
        log::trace!("entering {} at {:#010x}", self.pid, self.regs.eip);
        cpu.enter(&self.regs);
    }
}

impl<M: PhysMapper> Kernel<'_, M> {
    /// Save `interrupted` into the running process, then pick the head of the
    /// run queue and rotate it to the tail.
    ///
    /// Returns `None` if nothing is runnable.
    pub fn pick_next(&mut self, interrupted: Option<&Registers>) -> Option<Switch> {
        let _irq = IrqGuard::new();
        if let (Some(regs), Some(running)) = (interrupted, self.running)
            && let Some(process) = self.processes.get_mut(running)
        {
            process.current = *regs;
        }

        let Some(next) = self.run_queue.front() else {
            log::info!("no runnable process");
            return None;
        };
        self.run_queue.rotate();

        let Some(process) = self.processes.get(next) else {
            log::error!("run queue held a stale handle {next:?}");
            self.run_queue.remove(next);
            return None;
        };
        self.running = Some(next);
        log::debug!("switching to {}", process.pid);
        Some(Switch {
            pid: process.pid,
            root: process.root,
            kernel_stack_top: process.kernel_stack_top,
            regs: process.current,
        })
    }

    /// [`pick_next`](Self::pick_next) and [`Switch::activate`] in one go.
    ///
    /// Returns the pid that was entered, for callers whose [`Cpu::enter`]
    /// comes back.
    pub fn schedule<C: Cpu + ?Sized>(
        &mut self,
        cpu: &mut C,
        interrupted: Option<&Registers>,
    ) -> Option<Pid> {
        let switch = self.pick_next(interrupted)?;
        switch.activate(cpu);
        Some(switch.pid)
    }

    /// The process the CPU was last sent to.
    #[must_use]
    pub const fn running(&self) -> Option<ProcessHandle> {
        self.running
    }

    #[must_use]
    pub const fn run_queue(&self) -> &RunQueue {
        &self.run_queue
    }

    /// Put a process back on the run queue.
    ///
    /// Returns `false` for stale handles and processes already queued.
    pub fn enqueue(&mut self, handle: ProcessHandle) -> bool {
        let _irq = IrqGuard::new();
        self.processes.get(handle).is_some() && self.run_queue.push_back(handle)
    }
}
