//! # Kernel Configuration and Boot Interface
//!
//! The authoritative source for the memory layout of the i386 kernel and for
//! the data a multiboot loader hands over.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants for the higher-half design: where the kernel half
//! starts, which page-table slot serves as the temporary mapping window, how
//! the kernel heap is sized and where user code and stacks live. Constraints
//! between the constants are checked at compile time.
//!
//! ### Boot Information ([`boot`])
//! The multiboot magic check and the physical memory map, including the
//! reduction of the raw map to the regions the frame allocator may manage.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  unmapped                       │
//! 0x8000_0000 ├─────────────────────────────────┤ USER_CODE_VADDR
//!             │  user code                      │
//!             │  ...                            │
//!             │  user stack (grows down)        │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_VIRTUAL_BASE (PDE 768)
//!             │  kernel image                   │
//! 0xC03F_F000 │  temporary mapping window       │ TEMP_WINDOW_VADDR
//! 0xC040_0000 ├─────────────────────────────────┤
//!             │  reserved kernel page tables:   │
//!             │  frame bitmap, heap, kstacks    │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The kernel half is shared by every address space: process page directories
//! copy the kernel's PDEs 768..1024 when they are created.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
