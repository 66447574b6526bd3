//! Hierarchical state machine engine.
//!
//! States form a tree of `&'static` nodes; the machine is a cursor into
//! it. Dispatch bubbles the signal from the current state toward the
//! root until a reaction matches, exits eagerly down to the reacting
//! state, then executes the transition in SCXML order: exits up to the
//! least common ancestor, the reaction's action, entries down to the
//! target, and finally a drill through default children until an atomic
//! state is reached.

use arrayvec::ArrayVec;
use core::ptr;

use super::{ActionFn, Dispatched, GuardFn, Hook, Machine, Phase};
use crate::config::HSM_MAX_DEPTH;
use crate::event::{Event, Signal};
use crate::fault::FaultKind;
use crate::sched::Core;

/// Entry-path stack depth. One extra slot for the re-entered source of
/// an external self-transition.
const PATH_DEPTH: usize = HSM_MAX_DEPTH + 1;

/// One state node. Declared `static` by the application; identity is
/// pointer identity. `depth` is the ancestor count (root = 0).
pub struct State<C: 'static> {
    pub name: &'static str,
    pub parent: Option<&'static State<C>>,
    /// Default child entered when a transition lands here.
    pub child: Option<&'static State<C>>,
    pub depth: u8,
    pub enter: Option<Hook<C>>,
    pub quit: Option<Hook<C>>,
    /// Do-action, polled once per object step.
    pub service: Option<Hook<C>>,
    pub reactions: &'static [Reaction<C>],
}

/// One reaction row. Rows are scanned in declaration order; the first
/// signal match wins, which gives the application control over
/// precedence.
pub struct Reaction<C: 'static> {
    pub signal: Signal,
    pub guard: Option<GuardFn<C>>,
    pub action: Option<ActionFn<C>>,
    /// External transitions exit and re-enter the source even when the
    /// target is the source itself or one of its descendants.
    pub external: bool,
    pub target: &'static State<C>,
}

/// The machine: a cursor over a `State` tree.
pub struct Hsm<C: 'static> {
    root: &'static State<C>,
    current: &'static State<C>,
    phase: Phase,
    idle: Option<fn(&C) -> bool>,
}

impl<C> Hsm<C> {
    pub const fn new(root: &'static State<C>) -> Self {
        Self { root, current: root, phase: Phase::Idle, idle: None }
    }

    /// Install the idle predicate consulted before recalling deferred
    /// events.
    pub const fn with_idle(mut self, idle: fn(&C) -> bool) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn current(&self) -> &'static State<C> {
        self.current
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Is `state` the current state or one of its ancestors?
    pub fn is_in(&self, state: &'static State<C>) -> bool {
        let mut scan = Some(self.current);
        while let Some(s) = scan {
            if ptr::eq(s, state) {
                return true;
            }
            scan = s.parent;
        }
        false
    }

    fn enter_state(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        if let Some(hook) = self.current.enter {
            hook(ctx, core)?;
        }
        log::trace!("hsm enter {}", self.current.name);
        Ok(())
    }

    /// Run the exit hook and move to the superstate.
    fn exit_state(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        if let Some(hook) = self.current.quit {
            hook(ctx, core)?;
        }
        log::trace!("hsm exit {}", self.current.name);
        self.current = self.current.parent.ok_or(FaultKind::BadTopology)?;
        Ok(())
    }

    /// Enter default children until an atomic state is reached.
    fn drill(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        while let Some(child) = self.current.child {
            debug_assert_eq!(child.depth, self.current.depth + 1);
            self.current = child;
            self.enter_state(ctx, core)?;
        }
        Ok(())
    }

    /// Perform every exit the transition needs and record the entry
    /// path from below the LCA down to the target.
    fn transition_exits(
        &mut self,
        ctx: &mut C,
        core: &mut Core,
        target: &'static State<C>,
        external: bool,
    ) -> Result<ArrayVec<&'static State<C>, PATH_DEPTH>, FaultKind> {
        if target.depth as usize >= HSM_MAX_DEPTH {
            return Err(FaultKind::DepthExceeded);
        }
        let mut path: ArrayVec<&'static State<C>, PATH_DEPTH> = ArrayVec::new();
        let mut track = target;
        // Source deeper than target: exit up to the target's level.
        while self.current.depth > track.depth {
            self.exit_state(ctx, core)?;
        }
        // Target deeper than source: record its path up to the source's
        // level.
        while track.depth > self.current.depth {
            path.try_push(track).map_err(|_| FaultKind::DepthExceeded)?;
            track = track.parent.ok_or(FaultKind::BadTopology)?;
        }
        // Same level. Self-transition or target inside source: external
        // means the source is exited and re-entered.
        if ptr::eq(track, self.current) && external {
            self.exit_state(ctx, core)?;
            path.try_push(track).map_err(|_| FaultKind::DepthExceeded)?;
            track = track.parent.ok_or(FaultKind::BadTopology)?;
        }
        // Walk both cursors up together until they meet at the LCA.
        while !ptr::eq(self.current, track) {
            self.exit_state(ctx, core)?;
            path.try_push(track).map_err(|_| FaultKind::DepthExceeded)?;
            track = track.parent.ok_or(FaultKind::BadTopology)?;
        }
        Ok(path)
    }
}

impl<C> Machine<C> for Hsm<C> {
    fn init(&mut self, ctx: &mut C, core: &mut Core) -> Result<(), FaultKind> {
        self.phase = Phase::Construct;
        self.current = self.root;
        self.phase = Phase::Initialize;
        self.phase = Phase::InitTrans;
        self.drill(ctx, core)?;
        self.phase = Phase::Dispatch;
        log::trace!("hsm started in {}", self.current.name);
        Ok(())
    }

    fn dispatch(
        &mut self,
        ctx: &mut C,
        core: &mut Core,
        event: &Event,
    ) -> Result<Dispatched, FaultKind> {
        if self.is_final() {
            // A final machine absorbs everything without effect.
            return Ok(Dispatched::Handled);
        }
        // Bubble the signal up the hierarchy until a reaction matches.
        let mut scan = self.current;
        let (source, reaction) = loop {
            if let Some(r) = scan.reactions.iter().find(|r| r.signal == event.signal) {
                break (scan, r);
            }
            match scan.parent {
                Some(parent) => scan = parent,
                None => return Ok(Dispatched::Unhandled),
            }
        };
        if let Some(guard) = reaction.guard {
            if !guard(ctx, event) {
                return Ok(Dispatched::Handled);
            }
        }
        // The bubble moved the handling context up to `source`; leave
        // the nested states before anything else runs.
        while !ptr::eq(self.current, source) {
            self.exit_state(ctx, core)?;
        }
        let mut path = self.transition_exits(ctx, core, reaction.target, reaction.external)?;
        if let Some(action) = reaction.action {
            action(ctx, core, event)?;
        }
        while let Some(state) = path.pop() {
            self.current = state;
            self.enter_state(ctx, core)?;
        }
        self.drill(ctx, core)?;
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
        self.current.parent.is_none() && !ptr::eq(self.current, self.root)
    }
}
