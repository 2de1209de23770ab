use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical frame of the active page directory and the cache
/// controls used when the CPU walks it.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for the page directory.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the page directory.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31: page directory physical base >> 12.
    #[bits(20)]
    page_directory_4k: u32,
}

impl Cr3 {
    /// CR3 value selecting `root` as the page directory, write-back cached.
    #[must_use]
    pub const fn from_page_directory(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_page_directory_4k(root.frame_number())
    }

    /// The physical base of the page directory.
    #[must_use]
    pub const fn page_directory(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.page_directory_4k())
    }

    #[must_use]
    pub const fn page_directory_address(&self) -> PhysicalAddress {
        self.page_directory().base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_directory_round_trip() {
        let root = PhysicalPage::<Size4K>::from_frame_number(0x1234);
        let cr3 = Cr3::from_page_directory(root);
        assert_eq!(cr3.into_bits(), 0x0123_4000);
        assert_eq!(cr3.page_directory(), root);
        assert!(!cr3.pwt() && !cr3.pcd());
    }
}
