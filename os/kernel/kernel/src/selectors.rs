//! # Segment Selectors
//!
//! ```text
//!  15            3 2  1  0
//! +----------------+--+----+
//! |   Index[12:0]  |TI| RPL|
//! +----------------+--+----+  (TI=0 → GDT, TI=1 → LDT; RPL=0..3)
//! ```
//!
//! The GDT itself is built by the boot code. This module only names the
//! flat-model layout it is expected to have:
//!
//! | index | selector | segment |
//! |-------|----------|---------|
//! | 1 | `0x08` | kernel code |
//! | 2 | `0x10` | kernel data |
//! | 3 | `0x18` | user code |
//! | 4 | `0x20` | user data |
//! | 5 | `0x28` | TSS |

use bitfield_struct::bitfield;

/// Requested Privilege Level.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Rpl {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl Rpl {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => Self::Ring0,
            1 => Self::Ring1,
            2 => Self::Ring2,
            _ => Self::Ring3,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u16 {
        self as u16
    }
}

#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct SegmentSelector {
    #[bits(2)]
    pub rpl: Rpl,
    /// Table indicator: `false` for the GDT.
    pub ldt: bool,
    #[bits(13)]
    pub index: u16,
}

impl SegmentSelector {
    /// A GDT selector.
    #[inline]
    #[must_use]
    pub const fn gdt(index: u16, rpl: Rpl) -> Self {
        Self::new().with_index(index).with_rpl(rpl)
    }

    /// The raw value for `mov` and `iret` frames.
    #[inline]
    #[must_use]
    pub const fn encode(self) -> u16 {
        self.into_bits()
    }

    /// Selector widened for a 32-bit register slot.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.into_bits() as u32
    }
}

pub const KERNEL_CS: SegmentSelector = SegmentSelector::gdt(1, Rpl::Ring0);
pub const KERNEL_DS: SegmentSelector = SegmentSelector::gdt(2, Rpl::Ring0);
pub const USER_CS: SegmentSelector = SegmentSelector::gdt(3, Rpl::Ring3);
pub const USER_DS: SegmentSelector = SegmentSelector::gdt(4, Rpl::Ring3);
pub const TSS: SegmentSelector = SegmentSelector::gdt(5, Rpl::Ring0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_model_selectors() {
        assert_eq!(KERNEL_CS.encode(), 0x08);
        assert_eq!(KERNEL_DS.encode(), 0x10);
        assert_eq!(USER_CS.encode(), 0x18 | 3);
        assert_eq!(USER_DS.encode(), 0x20 | 3);
        assert_eq!(TSS.encode(), 0x28);
    }

    #[test]
    fn fields_decode() {
        let s = SegmentSelector::from_bits(0x23);
        assert_eq!(s.index(), 4);
        assert_eq!(s.rpl(), Rpl::Ring3);
        assert!(!s.ldt());
    }
}
