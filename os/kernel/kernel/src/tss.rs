//! # 32-bit Task State Segment
//!
//! The kernel does not use hardware task switching. The TSS only tells the
//! CPU which stack to load (`ss0:esp0`) when an interrupt arrives while ring 3
//! code is running. The scheduler points it at the kernel stack of every
//! process it activates.

use crate::selectors::SegmentSelector;
use core::mem::size_of;
use kernel_memory_addresses::VirtualAddress;

const _: () = assert!(size_of::<Tss32>() == 104);

/// Hardware layout of the i386 TSS.
///
/// 16-bit selector fields are followed by 16 reserved bits each. All fields
/// except `esp0`, `ss0` and `iomap_base` stay zero.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct Tss32 {
    prev_task: u16,
    _r0: u16,
    /// Ring 0 stack pointer loaded on a privilege change.
    esp0: u32,
    /// Ring 0 stack segment loaded with `esp0`.
    ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    general: [u32; 8],
    segments: [u32; 6],
    ldt: u16,
    _r4: u16,
    trap: u16,
    /// Offset of the I/O permission bitmap. Pointing past the end means
    /// there is none, so ring 3 port I/O faults.
    iomap_base: u16,
}

impl Default for Tss32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Tss32 {
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev_task: 0,
            _r0: 0,
            esp0: 0,
            ss0: 0,
            _r1: 0,
            esp1: 0,
            ss1: 0,
            _r2: 0,
            esp2: 0,
            ss2: 0,
            _r3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            general: [0; 8],
            segments: [0; 6],
            ldt: 0,
            _r4: 0,
            trap: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }

    /// Stack used on the next ring 3 → ring 0 transition.
    pub const fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: VirtualAddress) {
        self.ss0 = ss0.encode();
        self.esp0 = esp0.as_u32();
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> (SegmentSelector, VirtualAddress) {
        (
            SegmentSelector::from_bits(self.ss0),
            VirtualAddress::new(self.esp0),
        )
    }
}
