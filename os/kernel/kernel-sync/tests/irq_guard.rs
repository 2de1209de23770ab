//! Interrupt-state bookkeeping against the host's simulated `IF` flag.
//!
//! The flag is process-wide, so everything lives in a single test.

use kernel_sync::SpinMutex;
use kernel_sync::irq::{IrqGuard, cli_stop_interrupts, interrupts_enabled, sti_enable_interrupts};

#[test]
fn guards_disable_and_restore_interrupts() {
    sti_enable_interrupts();
    assert!(interrupts_enabled());

    // A single guard disables and restores.
    {
        let _g = IrqGuard::new();
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    // Nested guards: only the outermost one re-enables.
    {
        let _outer = IrqGuard::new();
        {
            let _inner = IrqGuard::new();
            assert!(!interrupts_enabled());
        }
        assert!(!interrupts_enabled(), "inner guard must not re-enable");
    }
    assert!(interrupts_enabled());

    // A guard taken with interrupts already off leaves them off.
    cli_stop_interrupts();
    {
        let _g = IrqGuard::new();
    }
    assert!(!interrupts_enabled());
    sti_enable_interrupts();

    // lock_irq holds both the lock and the interrupt state.
    let m = SpinMutex::new(7u32);
    {
        let mut g = m.lock_irq();
        *g += 1;
        assert!(!interrupts_enabled());
        assert!(m.try_lock().is_none());
    }
    assert!(interrupts_enabled());
    assert_eq!(*m.lock(), 8);
}
