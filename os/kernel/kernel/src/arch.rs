//! # i386 Glue
//!
//! The parts that only make sense on the real machine: the hardware
//! [`Cpu`], the window backend that uses `invlpg`, and the single kernel
//! instance the entry stubs talk to.
//!
//! All access to the kernel goes through [`with_kernel`], which holds the
//! lock with interrupts disabled. The page fault path only ever *tries* the
//! lock, so a fault raised while the kernel is busy still gets reported.

use crate::allocator::KernelHeapAccess;
use crate::context::{InitError, Kernel};
use crate::cpu::Cpu;
use crate::interrupts::page_fault::handle_page_fault;
use crate::interrupts::{InterruptRegistry, PAGE_FAULT_VECTOR, Registers};
use crate::process::Pid;
use crate::selectors::SegmentSelector;
use crate::tss::Tss32;
use core::ptr::NonNull;
use kernel_info::boot::BootInfo;
use kernel_info::memory::TEMP_WINDOW_VADDR;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_qemu::QemuLogger;
use kernel_registers::cr0::Cr0;
use kernel_registers::cr2::Cr2;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, tlb};
use kernel_sync::SpinMutex;
use kernel_vmem::{PageTable, PtEntry, TemporaryWindow, WindowBackend};
use log::LevelFilter;

/// The window slot is mapped, so its address is directly usable.
pub struct HardwareWindow;

impl WindowBackend for HardwareWindow {
    fn window_ptr(&self, va: VirtualAddress, _pte: PtEntry) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(va.as_usize())
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe { tlb::invalidate_page(va) }
    }
}

pub type HardwareMapper = TemporaryWindow<HardwareWindow>;

static TSS: SpinMutex<Tss32> = SpinMutex::new(Tss32::new());

/// Linear address of the TSS, for the descriptor the boot code installs.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn tss_address() -> VirtualAddress {
    let tss = TSS.lock();
    VirtualAddress::new(core::ptr::from_ref::<Tss32>(&tss).addr() as u32)
}

pub struct HardwareCpu;

impl Cpu for HardwareCpu {
    fn set_kernel_stack(&mut self, ss0: SegmentSelector, esp0: VirtualAddress) {
        TSS.lock().set_kernel_stack(ss0, esp0);
    }

    fn load_page_directory(&mut self, root: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_page_directory(root).store_unsafe() }
    }

    fn enter(&mut self, regs: &Registers) {
        // Interrupts come back on with the `eflags` image.
        unsafe {
            core::arch::asm!(
                "mov esp, {frame}",
                "pop gs",
                "pop fs",
                "pop es",
                "pop ds",
                "popad",
                "add esp, 8",
                "iretd",
                frame = in(reg) core::ptr::from_ref(regs),
                options(noreturn),
            )
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) }
        }
    }

    fn fault_address(&self) -> VirtualAddress {
        unsafe { Cr2::load_unsafe() }.fault_address()
    }
}

struct KernelSlot(Option<Kernel<'static, HardwareMapper>>);

// SAFETY: single core; the slot is only reached through `KERNEL`.
unsafe impl Send for KernelSlot {}

impl KernelHeapAccess for KernelSlot {
    fn kmalloc_aligned(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
        self.0.kmalloc_aligned(size, align)
    }

    fn kfree(&mut self, va: VirtualAddress) {
        self.0.kfree(va);
    }
}

static KERNEL: SpinMutex<KernelSlot> = SpinMutex::new(KernelSlot(None));

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: crate::KernelAllocator<'static, KernelSlot, kernel_sync::RawSpin> =
    crate::KernelAllocator::new(&KERNEL);
static INTERRUPTS: SpinMutex<InterruptRegistry> = SpinMutex::new(InterruptRegistry::new());
static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);

/// Bring up logging, the memory core and the fault handlers.
///
/// # Safety
/// - Paging must be on with the loader's page directory in `CR3`.
/// - `window_table` must be the kernel page table containing the PTE for
///   [`TEMP_WINDOW_VADDR`], mapped at that pointer for the kernel's lifetime.
/// - Call once, before interrupts are enabled.
///
/// # Errors
/// [`InitError::PagingDisabled`] if `CR0.PG` is clear, or any error of
/// [`Kernel::init`].
pub unsafe fn boot(info: &BootInfo, window_table: NonNull<PageTable>) -> Result<(), InitError> {
    if QemuLogger::install(&LOGGER).is_err() {
        log::warn!("logger already installed");
    }

    if !unsafe { Cr0::load_unsafe() }.pg_paging() {
        return Err(InitError::PagingDisabled);
    }
    let root = unsafe { Cr3::load_unsafe() }.page_directory();
    let window = unsafe {
        TemporaryWindow::new(
            window_table,
            VirtualAddress::new(TEMP_WINDOW_VADDR),
            HardwareWindow,
        )
    };

    let kernel = Kernel::init(info, window, root, |va, words| {
        let ptr = core::ptr::with_exposed_provenance_mut::<u32>(va.as_usize());
        // SAFETY: `va` was just mapped for at least `words` words and is
        // never unmapped.
        Some(unsafe { core::slice::from_raw_parts_mut(ptr, words) })
    })?;

    INTERRUPTS.lock().register(PAGE_FAULT_VECTOR, page_fault);
    KERNEL.lock_irq().0 = Some(kernel);
    log::info!("kernel core up");
    Ok(())
}

/// Run `f` against the kernel with interrupts disabled.
///
/// Returns `None` before [`boot`] has completed.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<'static, HardwareMapper>) -> R) -> Option<R> {
    KERNEL.lock_irq().0.as_mut().map(f)
}

/// Hand the CPU to the next runnable process.
///
/// Returns only if nothing is runnable.
pub fn schedule(interrupted: Option<&Registers>) -> Option<Pid> {
    let switch = with_kernel(|k| k.pick_next(interrupted)).flatten()?;
    switch.activate(&mut HardwareCpu);
    Some(switch.pid)
}

/// Install `handler` for `vector`.
pub fn register_interrupt(vector: u8, handler: crate::interrupts::InterruptHandler) {
    INTERRUPTS.lock_irq().register(vector, handler);
}

/// Called by the common entry stub with the saved register frame.
#[unsafe(no_mangle)]
pub extern "C" fn isr_dispatch(regs: &Registers) {
    let mut cpu = HardwareCpu;
    match INTERRUPTS.try_lock() {
        Some(registry) => registry.dispatch(&mut cpu, regs),
        None => crate::interrupts::unhandled(&mut cpu, regs),
    }
}

fn page_fault(cpu: &mut dyn Cpu, regs: &Registers) {
    if let Some(slot) = KERNEL.try_lock()
        && let Some(kernel) = slot.0.as_ref()
        && let Some(process) = kernel.running().and_then(|h| kernel.process(h))
    {
        log::error!("page fault in {}", process.pid);
    }
    handle_page_fault(cpu, regs)
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{info}");
    HardwareCpu.halt()
}
