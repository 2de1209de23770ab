#![allow(dead_code)]

use kernel::cpu::Cpu;
use kernel::interrupts::Registers;
use kernel::selectors::SegmentSelector;
use kernel::Kernel;
use kernel_info::boot::{BootInfo, KernelImage, MULTIBOOT_BOOTLOADER_MAGIC, MemoryMap, MemoryRegion};
use kernel_info::memory::KERNEL_VIRTUAL_BASE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::TemporaryWindow;
use kernel_vmem::testing::{BumpFrames, SimBackend, SimKernel, SimulatedRam};

pub type SimMapper<'r> = TemporaryWindow<SimBackend<'r>>;

/// What the kernel asked the CPU to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    KernelStack(SegmentSelector, VirtualAddress),
    PageDirectory(PhysicalPage<Size4K>),
    Enter(Registers),
}

/// A CPU that writes everything down and panics on halt.
#[derive(Default)]
pub struct RecordingCpu {
    pub events: Vec<Event>,
    pub cr2: u32,
}

impl RecordingCpu {
    pub fn entered(&self) -> Vec<Registers> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Enter(r) => Some(*r),
                _ => None,
            })
            .collect()
    }
}

impl Cpu for RecordingCpu {
    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: VirtualAddress) {
        self.events.push(Event::KernelStack(ss0, esp0));
    }

    fn load_page_directory(&mut self, root: PhysicalPage<Size4K>) {
        self.events.push(Event::PageDirectory(root));
    }

    fn enter(&mut self, regs: &Registers) {
        self.events.push(Event::Enter(*regs));
    }

    fn halt(&mut self) -> ! {
        panic!("halted");
    }

    fn fault_address(&self) -> VirtualAddress {
        VirtualAddress::new(self.cr2)
    }
}

/// A 1 MiB kernel image at 1 MiB followed by `ram_bytes - 1 MiB` of
/// usable memory.
pub fn boot_info(ram_bytes: u32) -> BootInfo {
    BootInfo {
        magic: MULTIBOOT_BOOTLOADER_MAGIC,
        memory_map: MemoryMap::from_regions(&[
            MemoryRegion::new(0, 0x0009_FC00),
            MemoryRegion::new(0x0010_0000, ram_bytes),
        ])
        .unwrap(),
        kernel: KernelImage {
            phys_start: 0x0010_0000,
            phys_end: 0x0020_0000,
            virt_start: KERNEL_VIRTUAL_BASE,
            virt_end: KERNEL_VIRTUAL_BASE + 0x0010_0000,
        },
    }
}

/// A kernel over `ram_bytes` of simulated memory.
pub fn boot(ram: &SimulatedRam, ram_bytes: u32) -> Kernel<'static, SimMapper<'_>> {
    let SimKernel { root, window } =
        SimKernel::boot(ram, &mut BumpFrames::new(0x0018_0000, 0x0020_0000), 16);
    Kernel::init(&boot_info(ram_bytes), window, root, |_, words| {
        Some(Box::leak(vec![0u32; words].into_boxed_slice()))
    })
    .unwrap()
}
