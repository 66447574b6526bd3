//! State machine engines.
//!
//! Handler outcomes follow one propagation policy crate-wide: hooks
//! return `Result<(), FaultKind>` (failure is a programming error,
//! recorded and contained at the call site), and dispatch additionally
//! distinguishes `Handled` from `Unhandled` — the latter is an expected
//! outcome that feeds the defer mechanism, never an error.

pub mod fsm;
pub mod hsm;

use crate::event::Event;
use crate::fault::FaultKind;
use crate::sched::Core;

/// Outcome of delivering one event to a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// A reaction consumed the event (possibly with a guard veto).
    Handled,
    /// No reaction matched anywhere along the ancestor chain.
    Unhandled,
}

/// Startup phases of a machine. Forward-only during startup, then the
/// machine stays in `Dispatch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Construct,
    Initialize,
    InitTrans,
    Dispatch,
}

/// Entry/exit/do hook.
pub type Hook<C> = fn(&mut C, &mut Core) -> Result<(), FaultKind>;
/// Transition effect.
pub type ActionFn<C> = fn(&mut C, &mut Core, &Event) -> Result<(), FaultKind>;
/// Transition guard; `false` vetoes the transition (still "handled").
pub type GuardFn<C> = fn(&mut C, &Event) -> bool;

/// What the active-object engine needs from a state machine.
pub trait Machine<C> {
    /// Construct, initialize and take the initial transition.
    fn init(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind>;

    /// Deliver one event.
    fn dispatch(
        &mut self,
        ctx: &mut C,
        core: &mut Core,
        event: &Event,
    ) -> Result<Dispatched, FaultKind>;

    /// Run the current state's do-action, if any.
    fn service(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind>;

    /// Willingness to reconsider deferred events. Defaults to always
    /// willing when no predicate is installed.
    fn is_idle(&self, ctx: &C) -> bool;

    /// The machine reached a final state; dispatch becomes a no-op.
    fn is_final(&self) -> bool;
}
