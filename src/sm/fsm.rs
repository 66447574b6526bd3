//! Flat state machine: the no-hierarchy specialization.
//!
//! Same reaction tables and hook discipline as the hierarchical engine,
//! but lookup never bubbles and transitions never compose: a reaction
//! either stays put (internal) or exits the current state, runs the
//! action and enters the target.

use core::ptr;

use super::{ActionFn, Dispatched, GuardFn, Hook, Machine, Phase};
use crate::event::{Event, Signal};
use crate::fault::FaultKind;
use crate::sched::Core;

/// One flat state, declared `static` by the application.
pub struct Flat<C: 'static> {
    pub name: &'static str,
    pub enter: Option<Hook<C>>,
    pub quit: Option<Hook<C>>,
    /// Do-action, polled once per object step.
    pub service: Option<Hook<C>>,
    pub reactions: &'static [FlatReaction<C>],
}

pub struct FlatReaction<C: 'static> {
    pub signal: Signal,
    pub guard: Option<GuardFn<C>>,
    pub action: Option<ActionFn<C>>,
    /// External self-transitions exit and re-enter the state.
    pub external: bool,
    pub target: &'static Flat<C>,
}

pub struct Fsm<C: 'static> {
    initial: &'static Flat<C>,
    current: &'static Flat<C>,
    phase: Phase,
    idle: Option<fn(&C) -> bool>,
}

impl<C> Fsm<C> {
    pub const fn new(initial: &'static Flat<C>) -> Self {
        Self { initial, current: initial, phase: Phase::Idle, idle: None }
    }

    pub const fn with_idle(mut self, idle: fn(&C) -> bool) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn current(&self) -> &'static Flat<C> {
        self.current
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_in(&self, state: &'static Flat<C>) -> bool {
        ptr::eq(self.current, state)
    }

    fn enter_state(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        if let Some(hook) = self.current.enter {
            hook(ctx, core)?;
        }
        log::trace!("fsm enter {}", self.current.name);
        Ok(())
    }

    fn exit_state(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        if let Some(hook) = self.current.quit {
            hook(ctx, core)?;
        }
        log::trace!("fsm exit {}", self.current.name);
        Ok(())
    }
}

impl<C> Machine<C> for Fsm<C> {
    fn init(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        self.phase = Phase::Construct;
        self.current = self.initial;
        self.phase = Phase::Initialize;
        self.phase = Phase::InitTrans;
        self.enter_state(ctx, core)?;
        self.phase = Phase::Dispatch;
        Ok(())
    }

    fn dispatch(
        &mut self,
        ctx: &mut C,
        core: &mut Core,
        event: &Event,
    ) -> Result<Dispatched, FaultKind> {
        let Some(reaction) = self
            .current
            .reactions
            .iter()
            .find(|r| r.signal == event.signal)
        else {
            return Ok(Dispatched::Unhandled);
        };
        if let Some(guard) = reaction.guard {
            if !guard(ctx, event) {
                return Ok(Dispatched::Handled);
            }
        }
        let internal = ptr::eq(reaction.target, self.current) && !reaction.external;
        if internal {
            if let Some(action) = reaction.action {
                action(ctx, core, event)?;
            }
            return Ok(Dispatched::Handled);
        }
        self.exit_state(ctx, core)?;
        if let Some(action) = reaction.action {
            action(ctx, core, event)?;
        }
        self.current = reaction.target;
        self.enter_state(ctx, core)?;
        self.phase = Phase::Dispatch;
        Ok(Dispatched::Handled)
    }

    fn service(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        if let Some(hook) = self.current.service {
            hook(ctx, core)?;
        }
        Ok(())
    }

    fn is_idle(&self, ctx: &C) -> bool {
        self.idle.map_or(true, |f| f(ctx))
    }

    fn is_final(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SIG_USER;
    use crate::port::NullPort;

    static PORT: NullPort = NullPort;

    const SIG_GO: Signal = SIG_USER;
    const SIG_KICK: Signal = SIG_USER + 1;
    const SIG_POKE: Signal = SIG_USER + 2;

    #[derive(Default)]
    struct Trace {
        log: Vec<&'static str>,
    }

    static OFF: Flat<Trace> = Flat {
        name: "off",
        enter: Some(|t, _| {
            t.log.push("enter:off");
            Ok(())
        }),
        quit: Some(|t, _| {
            t.log.push("exit:off");
            Ok(())
        }),
        service: None,
        reactions: &[FlatReaction {
            signal: SIG_GO,
            guard: None,
            action: Some(|t, _, _| {
                t.log.push("act:go");
                Ok(())
            }),
            external: false,
            target: &ON,
        }],
    };

    static ON: Flat<Trace> = Flat {
        name: "on",
        enter: Some(|t, _| {
            t.log.push("enter:on");
            Ok(())
        }),
        quit: Some(|t, _| {
            t.log.push("exit:on");
            Ok(())
        }),
        service: None,
        reactions: &[
            FlatReaction {
                signal: SIG_KICK,
                guard: None,
                action: Some(|t, _, _| {
                    t.log.push("act:kick");
                    Ok(())
                }),
                external: true,
                target: &ON,
            },
            FlatReaction {
                signal: SIG_POKE,
                guard: None,
                action: Some(|t, _, _| {
                    t.log.push("act:poke");
                    Ok(())
                }),
                external: false,
                target: &ON,
            },
        ],
    };

    fn setup() -> (Fsm<Trace>, Trace, Core) {
        let mut fsm = Fsm::new(&OFF);
        let mut trace = Trace::default();
        let mut core = Core::new(&PORT);
        fsm.init(&mut trace, &mut core).unwrap();
        (fsm, trace, core)
    }

    #[test]
    fn init_enters_the_initial_state() {
        let (fsm, trace, _) = setup();
        assert!(fsm.is_in(&OFF));
        assert_eq!(trace.log, ["enter:off"]);
    }

    #[test]
    fn transition_exits_acts_and_enters() {
        let (mut fsm, mut trace, mut core) = setup();
        trace.log.clear();
        fsm.dispatch(&mut trace, &mut core, &Event::synth(SIG_GO)).unwrap();
        assert_eq!(trace.log, ["exit:off", "act:go", "enter:on"]);
        assert!(fsm.is_in(&ON));
    }

    #[test]
    fn self_transition_external_vs_internal() {
        let (mut fsm, mut trace, mut core) = setup();
        fsm.dispatch(&mut trace, &mut core, &Event::synth(SIG_GO)).unwrap();
        trace.log.clear();
        fsm.dispatch(&mut trace, &mut core, &Event::synth(SIG_KICK)).unwrap();
        assert_eq!(trace.log, ["exit:on", "act:kick", "enter:on"]);
        trace.log.clear();
        fsm.dispatch(&mut trace, &mut core, &Event::synth(SIG_POKE)).unwrap();
        assert_eq!(trace.log, ["act:poke"]);
    }

    #[test]
    fn unknown_signal_is_unhandled() {
        let (mut fsm, mut trace, mut core) = setup();
        let out = fsm.dispatch(&mut trace, &mut core, &Event::synth(999)).unwrap();
        assert_eq!(out, Dispatched::Unhandled);
    }
}
