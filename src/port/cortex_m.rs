//! Cortex-M port: PRIMASK critical sections, WFI idle entry.

use cortex_m::{asm, interrupt, register::primask};

use super::{IrqToken, Port};

/// Port for ARMv6-M/ARMv7-M cores. The watchdog hooks are left to a
/// board layer; override them in a wrapper when the board has an IWDG.
pub struct CortexMPort;

impl Port for CortexMPort {
    #[inline]
    fn irq_save(&self) -> IrqToken {
        // PRIMASK "active" means exceptions are masked; the token
        // records whether interrupts were enabled on entry.
        let enabled = primask::read().is_inactive();
        interrupt::disable();
        IrqToken(enabled as u32)
    }

    #[inline]
    fn irq_restore(&self, token: IrqToken) {
        if token.0 != 0 {
            // Only re-enable when the section was entered with
            // interrupts enabled; nested sections stay masked.
            unsafe { interrupt::enable() };
        }
    }

    fn on_idle(&self, token: IrqToken) {
        // WFI wakes on any interrupt even with PRIMASK set; re-enabling
        // afterwards lets the pending wakeup interrupt fire immediately.
        asm::wfi();
        self.irq_restore(token);
    }
}
