//! # Kernel Memory Allocation
//!
//! Physical frames and kernel heap memory.
//!
//! ```text
//!  kmalloc / kfree
//!        │
//! ┌──────▼───────┐  grow   ┌───────────────────┐
//! │ KernelHeap   ├────────►│ KernelHeapBacking │
//! │ (K&R ring)   │         └──┬─────────────┬──┘
//! └──────────────┘   frames   │             │  map_kernel
//!                  ┌──────────▼───────┐  ┌──▼──────────────────┐
//!                  │ BitmapFrameAlloc │  │ kernel_vmem::       │
//!                  │ (1 bit / frame)  │  │ KernelSpace         │
//!                  └──────────────────┘  └─────────────────────┘
//! ```
//!
//! - [`frame_alloc`]: a bitmap over the usable memory regions. It also serves
//!   page table frames to `kernel-vmem` through [`kernel_vmem::FrameAlloc`].
//! - [`heap`]: the free-list allocator behind `kmalloc`. Block headers live
//!   in the heap memory and are reached through [`HeapMemory`].
//! - [`backing`]: where those headers are read and written, and how the heap
//!   grows, by mapping fresh frames into the kernel half.
//!
//! None of the types here lock. The kernel wraps them in its context, which
//! is only reachable through an interrupt-disabling mutex.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod backing;
pub mod frame_alloc;
pub mod heap;

pub use backing::{KernelHeapBacking, KernelHeapMemory};
pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use heap::{Header, HeapBacking, HeapError, HeapMemory, HeapStats, KernelHeap};
