//! The active-object manager: shared services and the scheduler.
//!
//! [`Core`] owns everything agents share (cell pool, event pool,
//! subscription register, scheduler inbox, timer bed, fault log, heap)
//! and is the handle every handler receives. [`Runtime`] wraps a `Core`
//! with the scheduler proper: a three-state loop that drains the inbox
//! into priority-ordered publication groups and drives one
//! run-to-completion step per iteration. When a more urgent event
//! arrives mid-group, the running group's `(floor, head, cursor)` is
//! saved on a fixed context stack and restored once the urgent group
//! completes. With no events pending the scheduler falls back to an
//! incremental polling sweep of the register.
//!
//! Active objects themselves stay owned by the application: every
//! scheduler entry point takes `&mut [&mut dyn Agent]`, and agents are
//! addressed by their registration index.

pub mod enroll;

use arrayvec::ArrayVec;
use heapless::Vec as FixedVec;

use crate::agent::{Agent, AgentId, Progress};
use crate::chain::{Cell, CellPool, Chain, Payload};
use crate::config::{AGENT_AMOUNT, DESC_AMOUNT, MSTACK_AMOUNT};
use crate::event::{Event, EventPool, EventRef, Release, Signal, PRIO_FLOOR, SIG_FAULT};
use crate::fault::{FaultKind, FaultLog, FaultRecord};
use crate::mem::{Heap, Pool, Ref};
use crate::port::Port;
use crate::time::timer::{TimerBed, TimerId};
use crate::time::TickCounter;

use self::enroll::Descriptor;

// ————————————————————— shared services —————————————————————

struct AgentSlot {
    prio: u16,
    name: &'static str,
    echain: Chain,
    dchain: Chain,
}

/// Shared runtime services, passed to every handler.
pub struct Core {
    port: &'static dyn Port,
    ticks: TickCounter,
    cells: CellPool,
    events: EventPool,
    descs: Pool<Descriptor, DESC_AMOUNT>,
    enroll: Chain,
    epoch: u32,
    inbox: Chain,
    agents: FixedVec<AgentSlot, AGENT_AMOUNT>,
    timers: TimerBed,
    faults: FaultLog,
    heap: Heap,
    lifted: Option<FaultRecord>,
}

impl Core {
    pub fn new(port: &'static dyn Port) -> Self {
        Self {
            port,
            ticks: TickCounter::new(),
            cells: CellPool::new(),
            events: EventPool::new(),
            descs: Pool::new(),
            enroll: Chain::new(),
            epoch: 0,
            inbox: Chain::new(),
            agents: FixedVec::new(),
            timers: TimerBed::new(),
            faults: FaultLog::new(),
            heap: Heap::new(),
            lifted: None,
        }
    }

    /// Record a programming fault at the caller's location and keep
    /// going; the scheduler lifts records into the fault event.
    #[track_caller]
    pub fn fault(&mut self, kind: FaultKind) {
        let location = core::panic::Location::caller();
        let port = self.port;
        let token = port.irq_save();
        self.faults
            .record(kind, location.file(), location.line(), self.ticks.now());
        port.irq_restore(token);
    }

    // ——— time ———

    /// Advance the tick counter. Called from the platform tick interrupt.
    pub fn tick_advance(&mut self) {
        self.ticks.advance();
    }

    pub fn now(&self) -> u32 {
        self.ticks.now()
    }

    // ——— events ———

    /// Construct a dynamic event. `None` is transient exhaustion: the
    /// producer decides whether to drop, retry or degrade.
    pub fn event_new(&mut self, signal: Signal, priority: u16, threshold: u16) -> Option<EventRef> {
        let port = self.port;
        let token = port.irq_save();
        let made = self.events.create(signal, priority, threshold);
        port.irq_restore(token);
        if made.is_none() {
            self.fault(FaultKind::PoolExhausted);
        }
        made
    }

    /// Construct a static event: delivered like any other, never
    /// recycled.
    pub fn event_static(
        &mut self,
        signal: Signal,
        priority: u16,
        threshold: u16,
    ) -> Option<EventRef> {
        let port = self.port;
        let token = port.irq_save();
        let made = self.events.create_static(signal, priority, threshold);
        port.irq_restore(token);
        if made.is_none() {
            self.fault(FaultKind::PoolExhausted);
        }
        made
    }

    pub fn event(&self, event: EventRef) -> Option<&Event> {
        self.events.get(event)
    }

    /// Attach an opaque payload pointer. The runtime never reads or
    /// frees it.
    pub fn event_set_record(&mut self, event: EventRef, record: *const ()) -> bool {
        match self.events.get_mut(event) {
            Some(evt) => {
                evt.record = record;
                true
            }
            None => false,
        }
    }

    /// Add one reference on behalf of a holder outside the chains.
    pub fn retain(&mut self, event: EventRef) {
        let port = self.port;
        let token = port.irq_save();
        let ok = self.events.retain(event);
        port.irq_restore(token);
        if !ok {
            self.fault(FaultKind::BadHandle);
        }
    }

    /// Drop one reference; dynamic events recycle at zero.
    pub fn release(&mut self, event: EventRef) -> Release {
        let port = self.port;
        let token = port.irq_save();
        let out = self.events.release(event);
        port.irq_restore(token);
        if out == Release::Stale {
            self.fault(FaultKind::BadHandle);
        }
        out
    }

    /// Refcount-zero test: no chain holds the event any more.
    pub fn event_settled(&self, event: EventRef) -> bool {
        self.events.settled(event)
    }

    // ——— posting ———

    /// Append to the scheduler inbox, priority-ordered, taking one
    /// reference for the inbox chain. ISR-safe under the port gate.
    pub fn post(&mut self, event: EventRef) -> Result<(), FaultKind> {
        let Some(priority) = self.events.get(event).map(|e| e.priority) else {
            self.fault(FaultKind::BadHandle);
            return Err(FaultKind::BadHandle);
        };
        let port = self.port;
        let token = port.irq_save();
        let bound = {
            let Self { cells, inbox, .. } = self;
            inbox.bind(cells, Payload::Event(event), priority)
        };
        if bound.is_ok() {
            self.events.retain(event);
        }
        port.irq_restore(token);
        match bound {
            Ok(()) => Ok(()),
            Err(kind) => {
                self.fault(kind);
                Err(kind)
            }
        }
    }

    /// Direct posting: append straight to one object's event chain,
    /// bypassing the subscription register.
    pub fn post_to(&mut self, id: AgentId, event: EventRef) -> Result<(), FaultKind> {
        let Some(priority) = self.events.get(event).map(|e| e.priority) else {
            self.fault(FaultKind::BadHandle);
            return Err(FaultKind::BadHandle);
        };
        let port = self.port;
        let token = port.irq_save();
        let bound = {
            let Self { cells, agents, .. } = self;
            match agents.get_mut(id.0 as usize) {
                Some(slot) => slot.echain.bind(cells, Payload::Event(event), priority),
                None => Err(FaultKind::BadArgument),
            }
        };
        if bound.is_ok() {
            self.events.retain(event);
        }
        port.irq_restore(token);
        match bound {
            Ok(()) => Ok(()),
            Err(kind) => {
                self.fault(kind);
                Err(kind)
            }
        }
    }

    pub(crate) fn inbox_pop(&mut self) -> Option<EventRef> {
        let port = self.port;
        let token = port.irq_save();
        let popped = {
            let Self { cells, inbox, .. } = self;
            inbox.pop(cells)
        };
        port.irq_restore(token);
        match popped {
            Some((Payload::Event(event), _)) => Some(event),
            Some(_) => {
                self.fault(FaultKind::BadHandle);
                None
            }
            None => None,
        }
    }

    // ——— per-agent chains ———

    pub(crate) fn register_agent(&mut self, prio: u16, name: &'static str) -> Option<AgentId> {
        let id = self.agents.len() as u16;
        self.agents
            .push(AgentSlot { prio, name, echain: Chain::new(), dchain: Chain::new() })
            .ok()?;
        Some(AgentId(id))
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agent_name(&self, id: AgentId) -> Option<&'static str> {
        self.agents.get(id.0 as usize).map(|s| s.name)
    }

    /// Pop the most urgent pending event of one object. The reference
    /// moves to the caller.
    pub(crate) fn agent_take_event(&mut self, id: AgentId) -> Option<EventRef> {
        let port = self.port;
        let token = port.irq_save();
        let popped = {
            let Self { cells, agents, .. } = self;
            match agents.get_mut(id.0 as usize) {
                Some(slot) => slot.echain.pop(cells),
                None => None,
            }
        };
        port.irq_restore(token);
        match popped {
            Some((Payload::Event(event), _)) => Some(event),
            _ => None,
        }
    }

    /// Park an event the machine declined; the caller's reference moves
    /// into the defer chain unchanged.
    pub(crate) fn agent_defer(&mut self, id: AgentId, event: EventRef) -> Result<(), FaultKind> {
        let Some(priority) = self.events.get(event).map(|e| e.priority) else {
            return Err(FaultKind::BadHandle);
        };
        let Self { cells, agents, .. } = self;
        match agents.get_mut(id.0 as usize) {
            Some(slot) => slot.dchain.bind(cells, Payload::Event(event), priority),
            None => Err(FaultKind::BadArgument),
        }
    }

    /// Take back the most urgent deferred event.
    pub(crate) fn agent_recall(&mut self, id: AgentId) -> Option<EventRef> {
        let Self { cells, agents, .. } = self;
        match agents.get_mut(id.0 as usize)?.dchain.pop(cells) {
            Some((Payload::Event(event), _)) => Some(event),
            _ => None,
        }
    }

    /// Pending and deferred counts for one object.
    pub fn agent_backlog(&self, id: AgentId) -> (usize, usize) {
        match self.agents.get(id.0 as usize) {
            Some(slot) => (slot.echain.len(&self.cells), slot.dchain.len(&self.cells)),
            None => (0, 0),
        }
    }

    pub(crate) fn agent_quiescent(&self, id: AgentId) -> bool {
        match self.agents.get(id.0 as usize) {
            Some(slot) => slot.echain.is_empty() && slot.dchain.is_empty(),
            None => true,
        }
    }

    /// Release every event still linked in the object's chains.
    pub fn flush_agent(&mut self, id: AgentId) {
        while let Some(event) = self.agent_recall(id) {
            self.release(event);
        }
        while let Some(event) = self.agent_take_event(id) {
            self.release(event);
        }
    }

    /// Full detach: unsubscribe everywhere, then flush both chains.
    /// This is the default exit behaviour of an active object.
    pub fn detach(&mut self, id: AgentId) {
        self.unsubscribe_all(id);
        self.flush_agent(id);
    }

    // ——— timers ———

    /// Arm a one-shot (`interval == 0`) or periodic timer delivering
    /// `event` to the inbox on expiry.
    pub fn timer_arm(
        &mut self,
        id: TimerId,
        count: i32,
        interval: i32,
        event: EventRef,
    ) -> Result<(), FaultKind> {
        let port = self.port;
        let token = port.irq_save();
        let armed = self.timers.arm(id, count, interval, event);
        port.irq_restore(token);
        if let Err(kind) = armed {
            self.fault(kind);
        }
        armed
    }

    /// Update counters in place; `Ok(false)` reports a timer that had
    /// already expired and auto-disarmed.
    pub fn timer_rearm(&mut self, id: TimerId, count: i32, interval: i32) -> Result<bool, FaultKind> {
        let port = self.port;
        let token = port.irq_save();
        let out = self.timers.rearm(id, count, interval);
        port.irq_restore(token);
        if let Err(kind) = out {
            self.fault(kind);
        }
        out
    }

    /// Disarm; harmless when already disarmed. Returns whether it was
    /// armed.
    pub fn timer_disarm(&mut self, id: TimerId) -> bool {
        let port = self.port;
        let token = port.irq_save();
        let out = self.timers.disarm(id);
        port.irq_restore(token);
        out
    }

    pub fn timer_armed(&self, id: TimerId) -> bool {
        self.timers.is_armed(id)
    }

    /// One timer tick: decrement every armed counter and post expired
    /// timers' events to the inbox. Called once per tick, after
    /// [`tick_advance`](Self::tick_advance).
    pub fn timer_tick(&mut self) {
        let port = self.port;
        let token = port.irq_save();
        let Self { timers, cells, events, inbox, faults, ticks, .. } = self;
        timers.advance(|event| {
            let Some(priority) = events.get(event).map(|e| e.priority) else {
                faults.record(FaultKind::BadHandle, file!(), line!(), ticks.now());
                return;
            };
            if inbox.bind(cells, Payload::Event(event), priority).is_ok() {
                events.retain(event);
            } else {
                faults.record(FaultKind::ChainExhausted, file!(), line!(), ticks.now());
            }
        });
        port.irq_restore(token);
    }

    // ——— heap ———

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ——— diagnostics ———

    pub fn inbox_len(&self) -> usize {
        self.inbox.len(&self.cells)
    }

    /// The fault record most recently lifted into the fault event.
    pub fn fault_snapshot(&self) -> Option<FaultRecord> {
        self.lifted
    }

    /// Records still waiting in the fault log.
    pub fn fault_pending(&self) -> usize {
        self.faults.len()
    }

    /// Every pooled structure back home: nothing leaked.
    pub fn all_recycled(&self) -> bool {
        self.cells.all_recycled() && self.events.all_recycled()
    }

    /// Low-watermarks for sizing: `(events, cells)`.
    pub fn margins(&self) -> (u16, u16) {
        (self.events.margin(), self.cells.margin())
    }
}

// ————————————————————— the scheduler —————————————————————

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SchedState {
    /// Inspect the inbox; open a publication group if the head event
    /// preempts the current floor.
    Drain,
    /// Drive one subscriber of the current publication group.
    Drive,
    /// No groups pending: incremental polling sweep of the register.
    Scan,
}

#[derive(Clone, Copy)]
struct Frame {
    floor: u16,
    head: Option<Ref<Cell>>,
    cursor: Option<Ref<Cell>>,
}

#[derive(Clone, Copy)]
struct ScanCursor {
    entry: Ref<Cell>,
    sub_head: Ref<Cell>,
    sub_cur: Ref<Cell>,
}

/// The scheduler: a [`Core`] plus the publication and scan state.
pub struct Runtime {
    pub core: Core,
    state: SchedState,
    floor: u16,
    group_head: Option<Ref<Cell>>,
    group_cursor: Option<Ref<Cell>>,
    ctx: ArrayVec<Frame, MSTACK_AMOUNT>,
    ctx_high: usize,
    scan: Option<ScanCursor>,
    scan_epoch: u32,
    sweep_progress: u16,
    sweep_clean: bool,
    fault_event: Option<EventRef>,
}

impl Runtime {
    /// Build the runtime and reserve the static fault event. The port's
    /// watchdog is brought up here; the application then attaches its
    /// agents and loops on [`step`](Self::step).
    pub fn new(port: &'static dyn Port) -> Self {
        let mut core = Core::new(port);
        let fault_event = core.event_static(SIG_FAULT, 0, 0);
        port.watchdog_init();
        Self {
            core,
            state: SchedState::Drain,
            floor: PRIO_FLOOR,
            group_head: None,
            group_cursor: None,
            ctx: ArrayVec::new(),
            ctx_high: 0,
            scan: None,
            scan_epoch: 0,
            sweep_progress: 0,
            sweep_clean: false,
            fault_event,
        }
    }

    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Register every agent and run its start hook (state machine init,
    /// initial transition, subscriptions). The same slice, in the same
    /// order, must be passed to every subsequent [`step`](Self::step).
    pub fn attach(&mut self, agents: &mut [&mut dyn Agent]) {
        for agent in agents.iter_mut() {
            let Some(id) = self.core.register_agent(agent.priority(), agent.name()) else {
                self.core.fault(FaultKind::PoolExhausted);
                return;
            };
            if let Err(kind) = agent.start(&mut self.core, id) {
                self.core.fault(kind);
            }
            log::debug!("agent {} '{}' attached prio={}", id.0, agent.name(), agent.priority());
        }
    }

    /// One bounded scheduler iteration: feed the watchdog, lift one
    /// fault record if the fault event is free, run exactly one state
    /// action, then consider sleeping.
    pub fn step(&mut self, agents: &mut [&mut dyn Agent]) {
        if agents.len() != self.core.agent_count() {
            self.core.fault(FaultKind::BadArgument);
            return;
        }
        self.core.port.watchdog_feed();
        self.lift_fault();
        match self.state {
            SchedState::Drain => self.drain(),
            SchedState::Drive => self.drive(agents),
            SchedState::Scan => self.scan(agents),
        }
        self.idle_check();
    }

    /// Priority floor of the running publication group (diagnostics).
    pub fn current_floor(&self) -> u16 {
        self.floor
    }

    /// High-water mark of the context stack, in frames.
    pub fn context_high_water(&self) -> usize {
        self.ctx_high
    }

    fn lift_fault(&mut self) {
        let Some(fault_event) = self.fault_event else {
            return;
        };
        if !self.core.event_settled(fault_event) {
            return;
        }
        let taken = {
            let port = self.core.port;
            let token = port.irq_save();
            let rec = self.core.faults.take();
            port.irq_restore(token);
            rec
        };
        if let Some(record) = taken {
            self.core.lifted = Some(record);
            let _ = self.core.post(fault_event);
        }
    }

    /// State 0: peek the inbox; a head event strictly more urgent than
    /// the floor opens a nested publication group.
    fn drain(&mut self) {
        let Some((_, priority)) = self.core.inbox.peek(&self.core.cells) else {
            self.state = SchedState::Drive;
            return;
        };
        if priority < self.floor {
            if self.ctx.is_full() {
                // No room to save the running group: finish it first.
                self.core.fault(FaultKind::ContextOverflow);
                self.state = SchedState::Drive;
                return;
            }
            let Some(event) = self.core.inbox_pop() else {
                self.state = SchedState::Drive;
                return;
            };
            self.sweep_clean = false;
            let Some(header) = self.core.event(event).copied() else {
                self.core.fault(FaultKind::BadHandle);
                self.state = SchedState::Drive;
                return;
            };
            match self.core.find_desc(header.signal) {
                None => {
                    // Nobody listens: drop the inbox reference.
                    self.core.release(event);
                }
                Some(desc) => match self.core.desc_subs_head(desc) {
                    None => {
                        self.core.release(event);
                    }
                    Some(subs_head) => {
                        self.ctx.push(Frame {
                            floor: self.floor,
                            head: self.group_head,
                            cursor: self.group_cursor,
                        });
                        if self.ctx.len() > self.ctx_high {
                            self.ctx_high = self.ctx.len();
                        }
                        self.floor = header.threshold;
                        self.group_head = Some(subs_head);
                        self.group_cursor = Some(subs_head);
                        log::trace!(
                            "group open sig={} floor={} depth={}",
                            header.signal,
                            self.floor,
                            self.ctx.len()
                        );
                        self.core.fan_out(desc, event);
                        self.core.release(event);
                    }
                },
            }
        }
        self.state = SchedState::Drive;
    }

    /// State 1: run one subscriber of the current group; on wrap-around
    /// restore the context saved when the group preempted.
    fn drive(&mut self, agents: &mut [&mut dyn Agent]) {
        let (Some(head), Some(cursor)) = (self.group_head, self.group_cursor) else {
            self.state = SchedState::Scan;
            return;
        };
        self.sweep_clean = false;
        if Chain::at_ref(&self.core.cells, head).is_none() {
            // The subscriber chain mutated under us.
            self.core.fault(FaultKind::BadHandle);
            self.reset_context();
            self.state = SchedState::Drain;
            return;
        }
        let Some((Payload::Agent(id), _)) = Chain::at_ref(&self.core.cells, cursor) else {
            self.core.fault(FaultKind::BadHandle);
            self.reset_context();
            self.state = SchedState::Drain;
            return;
        };
        run_agent(&mut self.core, agents, id);
        match Chain::next_ref(&self.core.cells, cursor) {
            None => {
                self.core.fault(FaultKind::BadHandle);
                self.reset_context();
            }
            Some(next) if next == head => {
                // Group complete: resume the preempted context.
                match self.ctx.pop() {
                    Some(frame) => {
                        self.floor = frame.floor;
                        self.group_head = frame.head;
                        self.group_cursor = frame.cursor;
                        log::trace!("group closed, floor back to {}", self.floor);
                    }
                    None => {
                        self.core.fault(FaultKind::ContextUnderflow);
                        self.reset_context();
                    }
                }
            }
            Some(next) => {
                self.group_cursor = Some(next);
            }
        }
        self.state = SchedState::Drain;
    }

    /// State 2: polling sweep — one subscriber of one register entry per
    /// iteration, restarted whenever subscriptions change underneath.
    fn scan(&mut self, agents: &mut [&mut dyn Agent]) {
        self.state = SchedState::Drain;
        if self.core.enroll.is_empty() {
            self.scan = None;
            self.sweep_progress = 0;
            return;
        }
        if self.scan_epoch != self.core.epoch {
            self.scan = None;
            self.scan_epoch = self.core.epoch;
        }
        let cursor = match self.scan {
            Some(cursor)
                if Chain::at_ref(&self.core.cells, cursor.entry).is_some()
                    && Chain::at_ref(&self.core.cells, cursor.sub_head).is_some()
                    && Chain::at_ref(&self.core.cells, cursor.sub_cur).is_some() =>
            {
                cursor
            }
            _ => {
                // (Re)start the sweep at the head of the register.
                self.sweep_progress = 0;
                let Some(cursor) = self.sweep_start() else {
                    self.scan = None;
                    return;
                };
                cursor
            }
        };
        if let Some((Payload::Agent(id), _)) = Chain::at_ref(&self.core.cells, cursor.sub_cur) {
            if run_agent(&mut self.core, agents, id) == Progress::Progressed {
                self.sweep_progress += 1;
            }
        }
        self.scan = self.sweep_advance(cursor);
    }

    fn sweep_start(&self) -> Option<ScanCursor> {
        let entry = self.core.enroll.head_ref(&self.core.cells)?;
        self.sweep_enter(entry)
    }

    /// Position the sweep on the first subscriber of a register entry.
    fn sweep_enter(&self, entry: Ref<Cell>) -> Option<ScanCursor> {
        let (payload, _) = Chain::at_ref(&self.core.cells, entry)?;
        let Payload::Entry(desc) = payload else {
            return None;
        };
        let sub_head = self.core.desc_subs_head(desc)?;
        Some(ScanCursor { entry, sub_head, sub_cur: sub_head })
    }

    /// Advance within the entry's subscribers, then to the next entry;
    /// a full wrap of the register closes the sweep.
    fn sweep_advance(&mut self, cursor: ScanCursor) -> Option<ScanCursor> {
        if let Some(next_sub) = Chain::next_ref(&self.core.cells, cursor.sub_cur) {
            if next_sub != cursor.sub_head {
                return Some(ScanCursor { sub_cur: next_sub, ..cursor });
            }
        }
        let enroll_head = self.core.enroll.head_ref(&self.core.cells)?;
        match Chain::next_ref(&self.core.cells, cursor.entry) {
            Some(next_entry) if next_entry != enroll_head => self.sweep_enter(next_entry),
            _ => {
                // Sweep complete.
                self.sweep_clean = self.sweep_progress == 0;
                self.sweep_progress = 0;
                None
            }
        }
    }

    /// Fault-tolerant fallback: drop every saved frame and return to the
    /// idle floor.
    fn reset_context(&mut self) {
        self.floor = PRIO_FLOOR;
        self.group_head = None;
        self.group_cursor = None;
        self.ctx.clear();
        log::warn!("scheduler context reset");
    }

    /// Sleep only when the inbox is empty, no group is running, and the
    /// last full sweep made no progress. `on_idle` runs with interrupts
    /// disabled and owns the restore token.
    fn idle_check(&mut self) {
        let port = self.core.port;
        let token = port.irq_save();
        let idle = self.core.inbox.is_empty()
            && self.group_head.is_none()
            && (self.core.enroll.is_empty() || self.sweep_clean);
        if idle {
            port.on_idle(token);
        } else {
            port.irq_restore(token);
        }
    }
}

/// Run one object step, converting handler failures into fault records.
fn run_agent(core: &mut Core, agents: &mut [&mut dyn Agent], id: AgentId) -> Progress {
    let Some(agent) = agents.get_mut(id.0 as usize) else {
        core.fault(FaultKind::BadArgument);
        return Progress::Idle;
    };
    match agent.step(core, id) {
        Ok(progress) => progress,
        Err(kind) => {
            core.fault(kind);
            Progress::Idle
        }
    }
}
