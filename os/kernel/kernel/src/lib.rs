//! # Kernel Core
//!
//! Processes, scheduling and fault handling on top of the memory crates.
//!
//! ```text
//!            ┌────────────────────── Kernel ───────────────────────┐
//!  boot ───► │ BitmapFrameAlloc   KernelHeap   ProcessTable  RunQueue │
//!            │        │              │              │          │    │
//!            │        └── kernel_vmem (window, page tables) ───┘    │
//!            └──────────────────────────┬──────────────────────────┘
//!                                       │ Switch
//!                                       ▼
//!                                 Cpu (TSS, CR3, iret)
//! ```
//!
//! Everything except [`arch`] is plain data manipulation behind the [`Cpu`]
//! trait and runs in host tests against `kernel_vmem::testing`.
//!
//! - [`context`]: the [`Kernel`] value and its bring-up, `kmalloc`/`kfree`.
//! - [`allocator`]: `GlobalAlloc` on top of `kmalloc`/`kfree`.
//! - [`process`]: process creation and teardown.
//! - [`scheduler`]: the FIFO run queue and context switches.
//! - [`interrupts`]: the register frame, handler registry and the page
//!   fault handler.
//! - [`selectors`], [`tss`]: the segment layout the boot code sets up.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod allocator;
#[cfg(all(feature = "asm", target_arch = "x86"))]
pub mod arch;
pub mod context;
pub mod cpu;
pub mod interrupts;
pub mod process;
pub mod scheduler;
pub mod selectors;
pub mod tss;

pub use allocator::KernelAllocator;
pub use context::{InitError, Kernel};
pub use cpu::Cpu;
pub use interrupts::{InterruptRegistry, Registers};
pub use process::{FrameRun, FrameRuns, Pid, Process, ProcessError, ProcessHandle, ProcessImage};
pub use scheduler::{RunQueue, Switch};
