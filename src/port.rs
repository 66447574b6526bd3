//! Platform port: the few CPU and board services the runtime consumes.
//!
//! The runtime is single-context (one foreground loop plus interrupt
//! service routines); every shared structure is mutated under a
//! save-and-disable / restore pair obtained here. Tokens stack naturally
//! on the call chain, so critical sections nest without counting.

use cfg_if::cfg_if;

/// Saved interrupt-enable state, returned by [`Port::irq_save`] and
/// consumed by [`Port::irq_restore`]. Opaque to the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqToken(pub u32);

/// Services the platform supplies to the runtime.
///
/// Implementations are expected to be cheap: `irq_save`/`irq_restore`
/// bracket every pool, chain, timer-list and inbox mutation.
pub trait Port {
    /// Save the current interrupt-enable state and disable interrupts.
    fn irq_save(&self) -> IrqToken;

    /// Restore a previously saved interrupt-enable state.
    fn irq_restore(&self, token: IrqToken);

    /// Bring up the hardware watchdog. Called once during runtime init.
    fn watchdog_init(&self) {}

    /// Feed the watchdog. Called once per scheduler iteration; loss of
    /// the outer loop therefore resets the device.
    fn watchdog_feed(&self) {}

    /// Enter a low-power state. Invoked with interrupts disabled and the
    /// token needed to restore them; the port must re-enable interrupts
    /// atomically with sleep entry, or at minimum before returning.
    fn on_idle(&self, token: IrqToken) {
        self.irq_restore(token);
    }
}

/// No-op port for host tests and bring-up on cores without a watchdog.
pub struct NullPort;

impl Port for NullPort {
    #[inline]
    fn irq_save(&self) -> IrqToken {
        IrqToken(0)
    }

    #[inline]
    fn irq_restore(&self, _token: IrqToken) {}
}

cfg_if! {
    if #[cfg(feature = "cortex-m-port")] {
        pub mod cortex_m;
        pub use cortex_m::CortexMPort;
    }
}
