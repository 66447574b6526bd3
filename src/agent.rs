//! Active objects.
//!
//! An active object is an application context `C` driven by a state
//! machine `M`, plus the lifecycle plumbing the scheduler needs. The
//! runtime never owns objects — the application keeps them (usually in
//! statics) and lends the scheduler a `&mut [&mut dyn Agent]` slice per
//! call; per-object event and defer chains live in the [`Core`], keyed
//! by the registration index, so handlers can post and publish while
//! their own object is borrowed.

use bitflags::bitflags;

use crate::fault::FaultKind;
use crate::sched::Core;
use crate::sm::fsm::Fsm;
use crate::sm::hsm::Hsm;
use crate::sm::{Dispatched, Machine};

/// Registration index of an active object: its position in the slice
/// passed to [`Runtime::attach`](crate::sched::Runtime::attach).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentId(pub u16);

/// What one run-to-completion step accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Nothing to do (or paused).
    Idle,
    /// A lifecycle request, deferred recall or event dispatch ran.
    Progressed,
}

bitflags! {
    /// Pending lifecycle requests, honoured at the next step boundary —
    /// never mid-dispatch.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Requests: u8 {
        const EXIT  = 1 << 0;
        const RESET = 1 << 1;
        const PAUSE = 1 << 2;
    }
}

/// Lifecycle hook: return `true` once the request is satisfied; `false`
/// keeps the object running and the request pending.
pub type LifecycleHook<C> = fn(&mut C, &mut Core, AgentId) -> bool;
/// Startup hook: state-machine init has run; subscribe and arm here.
pub type StartHook<C> = fn(&mut C, &mut Core, AgentId) -> Result<(), FaultKind>;

/// The capability set the scheduler drives.
pub trait Agent {
    /// Unique urgency among objects subscribed to the same signals;
    /// lower is more urgent.
    fn priority(&self) -> u16;

    fn name(&self) -> &'static str;

    /// Construct and initialize, take the initial transition, then let
    /// the application subscribe.
    fn start(&mut self, core: &mut Core, id: AgentId) -> Result<(), FaultKind>;

    /// Exactly one run-to-completion step.
    fn step(&mut self, core: &mut Core, id: AgentId) -> Result<Progress, FaultKind>;

    /// Machine idle and both chains empty.
    fn is_idle(&self, core: &Core, id: AgentId) -> bool;
}

/// Generic active object: context + machine + hooks.
pub struct Active<C: 'static, M: Machine<C>> {
    name: &'static str,
    prio: u16,
    machine: M,
    ctx: C,
    requests: Requests,
    on_start: Option<StartHook<C>>,
    on_exit: Option<LifecycleHook<C>>,
    on_reset: Option<LifecycleHook<C>>,
    on_probe: Option<fn(&mut C) -> bool>,
}

/// Active object driven by a hierarchical machine.
pub type HsmActive<C> = Active<C, Hsm<C>>;
/// Active object driven by a flat machine.
pub type FsmActive<C> = Active<C, Fsm<C>>;

impl<C, M: Machine<C>> Active<C, M> {
    pub const fn new(name: &'static str, prio: u16, machine: M, ctx: C) -> Self {
        Self {
            name,
            prio,
            machine,
            ctx,
            requests: Requests::empty(),
            on_start: None,
            on_exit: None,
            on_reset: None,
            on_probe: None,
        }
    }

    pub const fn with_on_start(mut self, hook: StartHook<C>) -> Self {
        self.on_start = Some(hook);
        self
    }

    /// Override the default exit behaviour (detach: unsubscribe-all and
    /// flush).
    pub const fn with_on_exit(mut self, hook: LifecycleHook<C>) -> Self {
        self.on_exit = Some(hook);
        self
    }

    /// Override the default reset behaviour (flush and re-run the
    /// initial transition).
    pub const fn with_on_reset(mut self, hook: LifecycleHook<C>) -> Self {
        self.on_reset = Some(hook);
        self
    }

    pub const fn with_probe(mut self, hook: fn(&mut C) -> bool) -> Self {
        self.on_probe = Some(hook);
        self
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Request exit; honoured at the next step boundary.
    pub fn quit(&mut self) {
        self.requests.insert(Requests::EXIT);
    }

    /// Request reset; honoured at the next step boundary.
    pub fn reset(&mut self) {
        self.requests.insert(Requests::RESET);
    }

    /// Park the object: steps return idle until resumed.
    pub fn pause(&mut self) {
        self.requests.insert(Requests::PAUSE);
    }

    pub fn resume(&mut self) {
        self.requests.remove(Requests::PAUSE);
    }

    pub fn is_paused(&self) -> bool {
        self.requests.contains(Requests::PAUSE)
    }

    /// Hardware identification hook, run outside normal scheduling.
    pub fn probe(&mut self) -> bool {
        match self.on_probe {
            Some(hook) => hook(&mut self.ctx),
            None => true,
        }
    }
}

impl<C, M: Machine<C>> Agent for Active<C, M> {
    fn priority(&self) -> u16 {
        self.prio
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&mut self, core: &mut Core, id: AgentId) -> Result<(), FaultKind> {
        self.machine.init(&mut self.ctx, core)?;
        if let Some(hook) = self.on_start {
            hook(&mut self.ctx, core, id)?;
        }
        Ok(())
    }

    fn step(&mut self, core: &mut Core, id: AgentId) -> Result<Progress, FaultKind> {
        if self.requests.contains(Requests::EXIT) {
            let done = match self.on_exit {
                Some(hook) => hook(&mut self.ctx, core, id),
                None => {
                    core.detach(id);
                    true
                }
            };
            if done {
                self.requests.remove(Requests::EXIT);
                log::debug!("agent {} exited", self.name);
                return Ok(Progress::Progressed);
            }
        }
        if self.requests.contains(Requests::RESET) {
            let done = match self.on_reset {
                Some(hook) => hook(&mut self.ctx, core, id),
                None => {
                    core.flush_agent(id);
                    self.machine.init(&mut self.ctx, core)?;
                    true
                }
            };
            if done {
                self.requests.remove(Requests::RESET);
                log::debug!("agent {} reset", self.name);
                return Ok(Progress::Progressed);
            }
        }
        if self.requests.contains(Requests::PAUSE) {
            return Ok(Progress::Idle);
        }

        // An idle machine reconsiders one deferred event before taking
        // new work.
        if self.machine.is_idle(&self.ctx) {
            if let Some(event) = core.agent_recall(id) {
                let Some(header) = core.event(event).copied() else {
                    return Err(FaultKind::BadHandle);
                };
                let outcome = self.machine.dispatch(&mut self.ctx, core, &header);
                core.release(event);
                outcome?;
                self.machine.service(&mut self.ctx, core)?;
                return Ok(Progress::Progressed);
            }
        }

        if let Some(event) = core.agent_take_event(id) {
            let Some(header) = core.event(event).copied() else {
                return Err(FaultKind::BadHandle);
            };
            match self.machine.dispatch(&mut self.ctx, core, &header) {
                Ok(Dispatched::Handled) => {
                    core.release(event);
                    self.machine.service(&mut self.ctx, core)?;
                }
                Ok(Dispatched::Unhandled) => {
                    // The reference moves to the defer chain, to be
                    // reconsidered when the machine next reports idle.
                    core.agent_defer(id, event)?;
                }
                Err(kind) => {
                    core.release(event);
                    return Err(kind);
                }
            }
            return Ok(Progress::Progressed);
        }

        // Nothing pending: poll the current state's do-action.
        self.machine.service(&mut self.ctx, core)?;
        Ok(Progress::Idle)
    }

    fn is_idle(&self, core: &Core, id: AgentId) -> bool {
        self.machine.is_idle(&self.ctx) && core.agent_quiescent(id)
    }
}
