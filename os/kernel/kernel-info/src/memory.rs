//! # Memory Layout

/// Size of a physical frame and of a virtual page.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Where the kernel half of every address space begins.
///
/// Everything at or above this address is mapped identically in all address
/// spaces; everything below belongs to the owning process.
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

/// First page directory index of the kernel half (`0xC000_0000 >> 22`).
pub const KERNEL_PDT_INDEX: usize = (KERNEL_VIRTUAL_BASE >> 22) as usize;

/// Memory below this physical address (BIOS, VGA, legacy DMA) is never handed
/// to the frame allocator.
pub const LOW_MEMORY_END: u32 = 0x0010_0000; // 1 MiB

/// The single page-table slot used to transiently map arbitrary frames.
///
/// This is the last page covered by the kernel's first page table, which is
/// always present since it also maps the kernel image.
pub const TEMP_WINDOW_VADDR: u32 = KERNEL_VIRTUAL_BASE + 0x003F_F000;

/// Kernel page tables allocated at init time in addition to the one mapping
/// the kernel image.
///
/// Kernel mappings never create new page tables afterwards, so these bound
/// the kernel's dynamic virtual space (heap, kernel stacks, frame bitmap).
pub const KERNEL_RESERVED_TABLES: usize = 3;

/// Upper bound of regions kept from the boot memory map.
pub const MAX_MEMORY_REGIONS: usize = 16;

/// Allocation granularity of the kernel heap, in bytes. One unit in front
/// of every block holds its header.
pub const KERNEL_HEAP_UNIT: u32 = 8;

/// Bytes committed to the kernel heap during init.
pub const KERNEL_HEAP_INITIAL_SIZE: u32 = 0x0001_0000;

/// Minimum heap growth, in [`KERNEL_HEAP_UNIT`]s, whenever the free list runs dry.
pub const KERNEL_HEAP_MIN_EXPANSION_UNITS: u32 = 1024;

/// Virtual address user code is loaded at.
pub const USER_CODE_VADDR: u32 = 0x8000_0000;

/// Exclusive top of the user stack; it grows down from here.
pub const USER_STACK_TOP: u32 = KERNEL_VIRTUAL_BASE;

/// Initial user-mode stack pointer.
pub const USER_INITIAL_ESP: u32 = USER_STACK_TOP - 4;

/// Default number of user stack pages per process.
pub const USER_STACK_PAGES: u32 = 1;

/// Size of a per-process kernel stack.
pub const KERNEL_STACK_SIZE: u32 = 4096;

/// Maximum number of live processes.
pub const MAX_PROCESSES: usize = 32;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_PDT_INDEX == 768);
    assert!(TEMP_WINDOW_VADDR.is_multiple_of(PAGE_SIZE));
    assert!(TEMP_WINDOW_VADDR >> 22 == KERNEL_VIRTUAL_BASE >> 22);
    assert!(KERNEL_PDT_INDEX + 1 + KERNEL_RESERVED_TABLES <= ENTRIES_PER_TABLE);
    assert!(KERNEL_HEAP_UNIT.is_power_of_two());
    assert!(KERNEL_HEAP_UNIT >= 8);
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_CODE_VADDR < USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE);
    assert!(USER_STACK_TOP <= KERNEL_VIRTUAL_BASE);
};
