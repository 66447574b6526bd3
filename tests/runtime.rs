//! End-to-end scheduler scenarios: publish fan-out and refcounts,
//! priority preemption with context save/restore, timer delivery,
//! subscription round-trips, fault lifting and the idle discipline.

use std::cell::{Cell as StdCell, RefCell};
use std::rc::Rc;

use axon_rt::{
    Active, Agent, AgentId, Core, Event, FaultKind, Hsm, HsmActive, IrqToken, NullPort, Port,
    Reaction, Runtime, Signal, State, TimerId, SIG_FAULT, SIG_USER,
};

const SIG_A: Signal = SIG_USER;
const SIG_SLOW: Signal = SIG_USER + 1;
const SIG_FAST: Signal = SIG_USER + 2;
const SIG_TMO: Signal = SIG_USER + 3;

type Log = Rc<RefCell<Vec<(&'static str, Signal)>>>;

struct Ctx {
    tag: &'static str,
    log: Log,
    fault_kinds: Vec<FaultKind>,
}

fn note(ctx: &mut Ctx, _core: &mut Core, event: &Event) -> Result<(), FaultKind> {
    ctx.log.borrow_mut().push((ctx.tag, event.signal));
    Ok(())
}

fn note_fault(ctx: &mut Ctx, core: &mut Core, event: &Event) -> Result<(), FaultKind> {
    ctx.log.borrow_mut().push((ctx.tag, event.signal));
    if let Some(record) = core.fault_snapshot() {
        ctx.fault_kinds.push(record.kind);
    }
    Ok(())
}

static ROOT: State<Ctx> = State {
    name: "root",
    parent: None,
    child: Some(&LISTEN),
    depth: 0,
    enter: None,
    quit: None,
    service: None,
    reactions: &[],
};

static LISTEN: State<Ctx> = State {
    name: "listen",
    parent: Some(&ROOT),
    child: None,
    depth: 1,
    enter: None,
    quit: None,
    service: None,
    reactions: &[
        Reaction { signal: SIG_A, guard: None, action: Some(note), external: false, target: &LISTEN },
        Reaction { signal: SIG_SLOW, guard: None, action: Some(note), external: false, target: &LISTEN },
        Reaction { signal: SIG_FAST, guard: None, action: Some(note), external: false, target: &LISTEN },
        Reaction { signal: SIG_TMO, guard: None, action: Some(note), external: false, target: &LISTEN },
        Reaction {
            signal: SIG_FAULT,
            guard: None,
            action: Some(note_fault),
            external: false,
            target: &LISTEN,
        },
    ],
};

fn listener(tag: &'static str, prio: u16, log: &Log) -> HsmActive<Ctx> {
    Active::new(
        tag,
        prio,
        Hsm::new(&ROOT),
        Ctx { tag, log: log.clone(), fault_kinds: Vec::new() },
    )
}

static PORT: NullPort = NullPort;

fn spin(rt: &mut Runtime, agents: &mut [&mut dyn Agent], steps: usize) {
    for _ in 0..steps {
        rt.step(agents);
    }
}

fn subscribe(rt: &mut Runtime, signal: Signal, priority: u16, id: AgentId) {
    let template = rt.core.event_new(signal, priority, priority).unwrap();
    rt.core.subscribe(template, id).unwrap();
}

#[test]
fn publish_reaches_every_subscriber_exactly_once() {
    let log: Log = Log::default();
    let mut o1 = listener("o1", 2, &log);
    let mut o2 = listener("o2", 7, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 2] = [&mut o1, &mut o2];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_A, 5, AgentId(0));
    subscribe(&mut rt, SIG_A, 5, AgentId(1));

    let event = rt.core.event_new(SIG_A, 5, 5).unwrap();
    assert_eq!(rt.core.publish(event), 2);
    assert_eq!(rt.core.event(event).unwrap().refs(), 2);
    assert_eq!(rt.core.agent_backlog(AgentId(0)), (1, 0));
    assert_eq!(rt.core.agent_backlog(AgentId(1)), (1, 0));

    spin(&mut rt, &mut agents, 12);
    // Both copies consumed, higher-urgency subscriber first, and the
    // dynamic event went home to its pool.
    assert_eq!(*log.borrow(), [("o1", SIG_A), ("o2", SIG_A)]);
    assert!(rt.core.all_recycled());
    assert_eq!(rt.core.fault_pending(), 0);
}

#[test]
fn urgent_event_preempts_a_running_publication_group() {
    let log: Log = Log::default();
    let mut slow_a = listener("slow_a", 1, &log);
    let mut slow_b = listener("slow_b", 6, &log);
    let mut fast = listener("fast", 3, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 3] = [&mut slow_a, &mut slow_b, &mut fast];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_SLOW, 10, AgentId(0));
    subscribe(&mut rt, SIG_SLOW, 10, AgentId(1));
    subscribe(&mut rt, SIG_FAST, 3, AgentId(2));

    let slow_evt = rt.core.event_new(SIG_SLOW, 10, 10).unwrap();
    rt.core.post(slow_evt).unwrap();

    // Open the group and drive exactly the first subscriber.
    rt.step(&mut agents); // drain: group opens, floor = 10
    assert_eq!(rt.current_floor(), 10);
    rt.step(&mut agents); // drive: slow_a handles the event
    assert_eq!(*log.borrow(), [("slow_a", SIG_SLOW)]);

    // A more urgent event lands mid-group (as a tick ISR would post it).
    let fast_evt = rt.core.event_new(SIG_FAST, 3, 3).unwrap();
    rt.core.post(fast_evt).unwrap();

    spin(&mut rt, &mut agents, 8);
    // The nested group ran to completion, then the paused group resumed
    // at its second subscriber.
    assert_eq!(
        *log.borrow(),
        [("slow_a", SIG_SLOW), ("fast", SIG_FAST), ("slow_b", SIG_SLOW)]
    );
    assert_eq!(rt.context_high_water(), 2);
    assert!(rt.core.all_recycled());
    assert_eq!(rt.core.fault_pending(), 0);
}

#[test]
fn one_shot_timer_delivers_through_the_inbox() {
    let log: Log = Log::default();
    let mut obj = listener("tmo", 2, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 1] = [&mut obj];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_TMO, 4, AgentId(0));

    let event = rt.core.event_static(SIG_TMO, 4, 4).unwrap();
    rt.core.timer_arm(TimerId(0), 3, 0, event).unwrap();

    for _ in 0..2 {
        rt.core.tick_advance();
        rt.core.timer_tick();
    }
    assert!(log.borrow().is_empty());
    assert!(rt.core.timer_armed(TimerId(0)));

    rt.core.tick_advance();
    rt.core.timer_tick();
    // Expired: disarmed, posted to the inbox with one reference.
    assert!(!rt.core.timer_armed(TimerId(0)));
    assert_eq!(rt.core.inbox_len(), 1);
    assert_eq!(rt.core.event(event).unwrap().refs(), 1);

    spin(&mut rt, &mut agents, 8);
    assert_eq!(*log.borrow(), [("tmo", SIG_TMO)]);
    assert!(rt.core.event_settled(event));
    assert!(rt.core.all_recycled());
}

#[test]
fn periodic_timer_redelivers_the_same_static_event() {
    let log: Log = Log::default();
    let mut obj = listener("tick", 2, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 1] = [&mut obj];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_TMO, 4, AgentId(0));

    let event = rt.core.event_static(SIG_TMO, 4, 4).unwrap();
    rt.core.timer_arm(TimerId(3), 2, 2, event).unwrap();

    for _ in 0..6 {
        rt.core.tick_advance();
        rt.core.timer_tick();
        spin(&mut rt, &mut agents, 8);
    }
    assert_eq!(log.borrow().len(), 3);
    assert!(rt.core.timer_armed(TimerId(3)));
    assert!(rt.core.event_settled(event));
    assert!(rt.core.all_recycled());
}

#[test]
fn subscribe_unsubscribe_round_trip_restores_the_register() {
    let log: Log = Log::default();
    let mut o1 = listener("o1", 2, &log);
    let mut o2 = listener("o2", 7, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 2] = [&mut o1, &mut o2];
    rt.attach(&mut agents);

    subscribe(&mut rt, SIG_A, 5, AgentId(0));
    subscribe(&mut rt, SIG_A, 5, AgentId(1));
    assert_eq!(rt.core.subscriber_count(SIG_A), 2);

    let template = rt.core.event_new(SIG_A, 5, 5).unwrap();
    rt.core.unsubscribe(template, AgentId(0)).unwrap();
    // One subscriber left: the descriptor survives.
    assert_eq!(rt.core.subscriber_count(SIG_A), 1);

    let template = rt.core.event_new(SIG_A, 5, 5).unwrap();
    rt.core.unsubscribe(template, AgentId(1)).unwrap();
    // Last one out: the descriptor is unbound and everything recycled.
    assert_eq!(rt.core.subscriber_count(SIG_A), 0);
    assert!(rt.core.all_recycled());

    // Publishing into the now-empty register releases immediately.
    let event = rt.core.event_new(SIG_A, 5, 5).unwrap();
    assert_eq!(rt.core.publish(event), 0);
    assert!(rt.core.all_recycled());
}

#[test]
fn duplicate_subscription_is_a_no_op() {
    let log: Log = Log::default();
    let mut o1 = listener("o1", 2, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 1] = [&mut o1];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_A, 5, AgentId(0));
    subscribe(&mut rt, SIG_A, 5, AgentId(0));
    assert_eq!(rt.core.subscriber_count(SIG_A), 1);

    let event = rt.core.event_new(SIG_A, 5, 5).unwrap();
    assert_eq!(rt.core.publish(event), 1);
    spin(&mut rt, &mut agents, 8);
    assert_eq!(log.borrow().len(), 1);
    assert!(rt.core.all_recycled());
}

#[test]
fn faults_are_lifted_into_the_static_fault_event() {
    let log: Log = Log::default();
    let mut watcher = listener("watcher", 1, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 1] = [&mut watcher];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_FAULT, 0, AgentId(0));

    // Provoke a programming fault: double-arm a timer.
    let event = rt.core.event_static(SIG_TMO, 4, 4).unwrap();
    rt.core.timer_arm(TimerId(0), 5, 0, event).unwrap();
    assert!(rt.core.timer_arm(TimerId(0), 5, 0, event).is_err());
    assert_eq!(rt.core.fault_pending(), 1);

    spin(&mut rt, &mut agents, 10);
    assert_eq!(*log.borrow(), [("watcher", SIG_FAULT)]);
    assert_eq!(rt.core.fault_pending(), 0);
    assert_eq!(watcher.context().fault_kinds, [FaultKind::TimerMisuse]);
}

struct SleepyPort {
    idles: StdCell<u32>,
}

impl Port for SleepyPort {
    fn irq_save(&self) -> IrqToken {
        IrqToken(1)
    }
    fn irq_restore(&self, _token: IrqToken) {}
    fn on_idle(&self, _token: IrqToken) {
        self.idles.set(self.idles.get() + 1);
    }
}

#[test]
fn idle_hook_fires_only_after_a_clean_sweep() {
    let port: &'static SleepyPort = Box::leak(Box::new(SleepyPort { idles: StdCell::new(0) }));
    let log: Log = Log::default();
    let mut obj = listener("o", 2, &log);
    let mut rt = Runtime::new(port);
    let mut agents: [&mut dyn Agent; 1] = [&mut obj];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_A, 5, AgentId(0));

    // Pending work holds sleep off until a full sweep finds nothing.
    let event = rt.core.event_new(SIG_A, 5, 5).unwrap();
    rt.core.post(event).unwrap();
    rt.step(&mut agents);
    assert_eq!(port.idles.get(), 0);

    spin(&mut rt, &mut agents, 12);
    assert!(port.idles.get() > 0);
    assert_eq!(*log.borrow(), [("o", SIG_A)]);
}

#[test]
fn unsubscribed_post_is_released_by_the_scheduler() {
    let log: Log = Log::default();
    let mut obj = listener("o", 2, &log);
    let mut rt = Runtime::new(&PORT);
    let mut agents: [&mut dyn Agent; 1] = [&mut obj];
    rt.attach(&mut agents);
    subscribe(&mut rt, SIG_A, 5, AgentId(0));

    let orphan = rt.core.event_new(SIG_FAST, 3, 3).unwrap();
    rt.core.post(orphan).unwrap();
    spin(&mut rt, &mut agents, 6);
    // Nobody subscribes to SIG_FAST: dropped and recycled.
    assert!(log.borrow().is_empty());
    assert!(rt.core.all_recycled());
}
