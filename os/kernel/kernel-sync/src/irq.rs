use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};

/// A mutex guard that also disables interrupts while held.
///
/// Created via [`Mutex::lock_irq`]: it saves the interrupt state and
/// disables interrupts, then acquires the mutex. Both are released in reverse
/// order on drop, so an interrupt handler can never spin on a lock its own
/// CPU already holds.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinMutex;
///
/// static M: SpinMutex<u32> = SpinMutex::new(0);
///
/// {
///     let mut g = M.lock_irq();
///     *g += 1;
/// }
/// assert_eq!(*M.lock(), 1);
/// ```
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the lock is released before interrupts come back.
    g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.g
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.g
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Dropping the guard releases the mutex and restores interrupts if they
    /// were previously enabled.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let g = self.lock();
        IrqMutex { g, _irq: irq }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
mod cpu {
    /// `IF` bit of `EFLAGS`.
    const EFLAGS_IF: u32 = 1 << 9;

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enabled() -> bool {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
        r & EFLAGS_IF != 0
    }
}

/// Without the hardware, interrupt state is a single process-wide flag that
/// starts out enabled.
#[cfg(not(all(feature = "asm", target_arch = "x86")))]
mod cpu {
    use core::sync::atomic::{AtomicBool, Ordering};

    static IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn disable() {
        IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        IF.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn enabled() -> bool {
        IF.load(Ordering::SeqCst)
    }
}

/// Disables hardware interrupts (`cli`).
///
/// Ring 0 only when running on the hardware.
#[inline]
pub fn cli_stop_interrupts() {
    cpu::disable();
}

/// Enables hardware interrupts (`sti`).
///
/// Ring 0 only when running on the hardware.
#[inline]
pub fn sti_enable_interrupts() {
    cpu::enable();
}

/// Whether `EFLAGS.IF` is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    cpu::enabled()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were enabled
/// before, so guards nest.
///
/// ```
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new();
///     // critical section
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
