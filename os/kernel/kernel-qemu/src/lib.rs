//! # QEMU debug console output
//!
//! Byte-wise output to the `debugcon` port (`0xE9`) and a [`log::Log`]
//! implementation on top of it.
//!
//! Start QEMU with `-debugcon stdio` (or `-debugcon file:debug.log`) to see
//! the output. Without the `enabled` feature, or when not built for i386,
//! every write is a no-op, so the macros can stay in place everywhere.
//!
//! ```no_run
//! use kernel_qemu::{QemuLogger, qemu_trace};
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! qemu_trace!("early boot: {:#x}\n", 0x2BAD_B002_u32);
//! QemuLogger::install(&LOGGER).ok();
//! log::info!("paging enabled");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, format_record};

#[cfg(all(feature = "enabled", target_arch = "x86"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// Port of QEMU's (and Bochs') `debugcon` device.
    const QEMU_DEBUG_PORT: u16 = 0xE9;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe { outb(QEMU_DEBUG_PORT, c) }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort: the sink itself cannot fail.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(all(feature = "enabled", target_arch = "x86")))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// `print!`-style output to the debug console, without allocating.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
