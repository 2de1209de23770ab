use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Who may access a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Privilege {
    /// Ring 0 only.
    Supervisor,
    /// Ring 3 as well.
    User,
}

/// A single 32-bit i386 paging entry (PDE or PTE) in its raw bitfield form.
///
/// Both levels share this layout. The entry either points to a page table
/// (in a PDE with `PS=0`) or maps a 4 KiB frame (in a PTE).
///
/// ### Bit layout
///
/// | Bits  | Name          | Meaning |
/// |-------|---------------|---------|
/// | 0     | `P`           | Valid entry if set |
/// | 1     | `RW`          | Writable if set |
/// | 2     | `US`          | User-mode accessible if set |
/// | 3     | `PWT`         | Write-through caching |
/// | 4     | `PCD`         | Disable caching |
/// | 5     | `A`           | Accessed |
/// | 6     | `D`           | Dirty (PTE only) |
/// | 7     | `PS` / `PAT`  | 4 MiB page in a PDE, PAT in a PTE |
/// | 8     | `G`           | Global (PTE only) |
/// | 9–11  | available     | Free for the OS |
/// | 12–31 | `frame`       | Physical frame number |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Supervisor writes ignore this unless `CR0.WP` is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// The effective permission is the intersection of PDE and PTE.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE; PAT in a PTE.
    pub large_page: bool,

    /// Global (G, bit 8). Needs `CR4.PGE`.
    pub global_translation: bool,

    /// Bits 9–11, ignored by hardware.
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12–31).
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame())
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present leaf flags for the given access rights.
    #[inline]
    #[must_use]
    pub const fn new_leaf(writable: bool, privilege: Privilege) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_user_access(matches!(privilege, Privilege::User))
    }
}
