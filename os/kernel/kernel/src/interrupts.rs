//! # Interrupt Dispatch
//!
//! Low-level entry stubs push a [`Registers`] frame and hand it to
//! [`InterruptRegistry::dispatch`]. Handlers are plain function pointers
//! keyed by vector. A CPU exception without a handler is fatal.

pub mod page_fault;

use crate::cpu::Cpu;
use crate::selectors::{USER_CS, USER_DS};
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::eflags::Eflags;

pub const PAGE_FAULT_VECTOR: u8 = 0x0E;

/// Vectors below this are CPU exceptions.
pub const EXCEPTION_VECTORS: u8 = 32;

/// Register frame as laid out on the stack by the entry stubs.
///
/// Segment registers first, then `pusha`, then the vector and error code
/// pushed by the stub, then what the CPU pushed itself.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` as saved by `pusha`; ignored on return.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Stack pointer to return to when leaving for ring 3.
    pub user_esp: u32,
    pub ss: u32,
}

impl Registers {
    /// A fresh ring 3 context entering at `eip` with stack `esp`.
    ///
    /// Interrupts are enabled and every data segment is the user data
    /// segment.
    #[must_use]
    pub const fn user_entry(eip: VirtualAddress, esp: VirtualAddress) -> Self {
        let ds = USER_DS.as_u32();
        Self {
            gs: ds,
            fs: ds,
            es: ds,
            ds,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: 0,
            error_code: 0,
            eip: eip.as_u32(),
            cs: USER_CS.as_u32(),
            eflags: Eflags::user_default().into_bits(),
            user_esp: esp.as_u32(),
            ss: ds,
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Data segments: gs[{:#X}], fs[{:#X}], es[{:#X}], ds[{:#X}]",
            self.gs, self.fs, self.es, self.ds
        )?;
        let rows = [
            ("edi", self.edi),
            ("esi", self.esi),
            ("ebp", self.ebp),
            ("esp", self.esp),
            ("ebx", self.ebx),
            ("edx", self.edx),
            ("ecx", self.ecx),
            ("eax", self.eax),
            ("eip", self.eip),
            ("cs", self.cs),
            ("eflags", self.eflags),
            ("usersp", self.user_esp),
            ("ss", self.ss),
        ];
        for (name, value) in rows {
            writeln!(f, "{name}: {value:#010X}")?;
        }
        Ok(())
    }
}

const EXCEPTION_NAMES: [&str; 20] = [
    "Divide Error",
    "Debug Exception",
    "NMI Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection",
    "Page Fault",
    "(reserved)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
];

/// Human-readable name of an exception vector.
#[must_use]
pub fn exception_name(vector: u32) -> &'static str {
    usize::try_from(vector)
        .ok()
        .and_then(|v| EXCEPTION_NAMES.get(v))
        .copied()
        .unwrap_or("(reserved)")
}

/// Diagnostic for an exception nobody handled.
pub struct ExceptionReport<'r> {
    pub regs: &'r Registers,
    pub explanation: &'r str,
}

impl fmt::Display for ExceptionReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Unhandled exception - {:#X} : [errno - {:#X}]: {}",
            self.regs.vector, self.regs.error_code, self.explanation
        )?;
        write!(f, "{}", self.regs)
    }
}

/// Log `regs` as an unhandled exception and stop.
pub fn unhandled<C: Cpu + ?Sized>(cpu: &mut C, regs: &Registers) -> ! {
    let report = ExceptionReport {
        regs,
        explanation: exception_name(regs.vector),
    };
    log::error!("{report}");
    cpu.halt()
}

pub type InterruptHandler = fn(&mut dyn Cpu, &Registers);

/// Handlers by vector.
pub struct InterruptRegistry {
    handlers: [Option<InterruptHandler>; 256],
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: [None; 256],
        }
    }

    /// A registry with the kernel's own fault handlers installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(PAGE_FAULT_VECTOR, page_fault::handler);
        r
    }

    /// Install `handler` for `vector`, returning the one it replaces.
    pub fn register(&mut self, vector: u8, handler: InterruptHandler) -> Option<InterruptHandler> {
        log::debug!("interrupt handler registered for vector {vector:#X}");
        self.handlers[usize::from(vector)].replace(handler)
    }

    #[must_use]
    pub fn handler(&self, vector: u8) -> Option<InterruptHandler> {
        self.handlers[usize::from(vector)]
    }

    /// Run the handler for `regs.vector`.
    ///
    /// Exceptions without a handler halt through [`unhandled`]; other
    /// vectors are logged and ignored.
    pub fn dispatch(&self, cpu: &mut dyn Cpu, regs: &Registers) {
        let handler = u8::try_from(regs.vector).ok().and_then(|v| self.handler(v));
        match handler {
            Some(h) => h(cpu, regs),
            None if regs.vector < u32::from(EXCEPTION_VECTORS) => unhandled(cpu, regs),
            None => log::debug!("no handler for vector {:#X}", regs.vector),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_context() {
        let r = Registers::user_entry(
            VirtualAddress::new(0x8000_0010),
            VirtualAddress::new(0xBFFF_FFFC),
        );
        assert_eq!(r.eip, 0x8000_0010);
        assert_eq!(r.user_esp, 0xBFFF_FFFC);
        assert_eq!(r.eflags, 0x202);
        assert_eq!(r.cs, 0x18 | 3);
        for seg in [r.ss, r.ds, r.es, r.fs, r.gs] {
            assert_eq!(seg, 0x20 | 3);
        }
    }

    #[test]
    fn exception_names() {
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(13), "General Protection");
        assert_eq!(exception_name(31), "(reserved)");
    }

    #[test]
    fn report_starts_with_the_summary_line() {
        let regs = Registers {
            vector: 13,
            error_code: 0x10,
            eip: 0xC010_2030,
            ..Registers::default()
        };
        let text = ExceptionReport {
            regs: &regs,
            explanation: exception_name(regs.vector),
        }
        .to_string();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Unhandled exception - 0xD : [errno - 0x10]: General Protection")
        );
        assert!(text.contains("eip: 0xC0102030"));
        assert!(text.contains("usersp: "));
    }

    #[test]
    fn defaults_handle_page_faults() {
        let r = InterruptRegistry::with_defaults();
        assert!(r.handler(PAGE_FAULT_VECTOR).is_some());
        assert!(r.handler(13).is_none());
    }
}
