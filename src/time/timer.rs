//! Software timers.
//!
//! A fixed bed of timer slots, addressed by [`TimerId`]. Armed timers
//! are linked into one intrusive list, newest first; every tick each
//! armed counter is decremented and expired timers post their event to
//! the scheduler inbox. `interval == 0` is one-shot (the timer disarms
//! itself), anything else reloads the counter.
//!
//! A timer armed at tick `T` with count `N` fires no earlier than tick
//! `T + N`; timers expiring on the same tick fire in list order.

use crate::config::TIMER_AMOUNT;
use crate::event::EventRef;
use crate::fault::FaultKind;
use crate::mem::pool::NIL;

/// Slot index into the timer bed. Firmware usually assigns these as
/// constants, one per timed activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(pub u16);

#[derive(Clone, Copy)]
struct TimerSlot {
    armed: bool,
    counter: i32,
    interval: i32,
    event: Option<EventRef>,
    next: u16,
    prev: u16,
}

const IDLE_SLOT: TimerSlot = TimerSlot {
    armed: false,
    counter: 0,
    interval: 0,
    event: None,
    next: NIL,
    prev: NIL,
};

pub struct TimerBed {
    slots: [TimerSlot; TIMER_AMOUNT],
    head: u16,
}

impl TimerBed {
    pub const fn new() -> Self {
        Self { slots: [IDLE_SLOT; TIMER_AMOUNT], head: NIL }
    }

    /// Arm a disarmed timer. Double-arm, a zero count or a negative
    /// interval are recorded faults and leave the timer untouched.
    pub fn arm(
        &mut self,
        id: TimerId,
        count: i32,
        interval: i32,
        event: EventRef,
    ) -> Result<(), FaultKind> {
        let idx = id.0 as usize;
        if idx >= TIMER_AMOUNT {
            return Err(FaultKind::BadArgument);
        }
        if self.slots[idx].armed || count <= 0 || interval < 0 {
            return Err(FaultKind::TimerMisuse);
        }
        let head = self.head;
        let slot = &mut self.slots[idx];
        slot.armed = true;
        slot.counter = count;
        slot.interval = interval;
        slot.event = Some(event);
        slot.next = head;
        slot.prev = NIL;
        if head != NIL {
            self.slots[head as usize].prev = id.0;
        }
        self.head = id.0;
        log::trace!("timer {} armed count={} interval={}", id.0, count, interval);
        Ok(())
    }

    /// Update counters in place. `Ok(false)` reports a timer that had
    /// already expired and auto-disarmed (or was never armed).
    pub fn rearm(&mut self, id: TimerId, count: i32, interval: i32) -> Result<bool, FaultKind> {
        let idx = id.0 as usize;
        if idx >= TIMER_AMOUNT {
            return Err(FaultKind::BadArgument);
        }
        if count <= 0 || interval < 0 {
            return Err(FaultKind::TimerMisuse);
        }
        let slot = &mut self.slots[idx];
        slot.counter = count;
        slot.interval = interval;
        Ok(slot.armed)
    }

    /// Disarm; no harm in disarming a disarmed timer. Returns whether it
    /// was armed.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        let idx = id.0 as usize;
        if idx >= TIMER_AMOUNT || !self.slots[idx].armed {
            return false;
        }
        self.unlink(id.0);
        log::trace!("timer {} disarmed", id.0);
        true
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        (id.0 as usize) < TIMER_AMOUNT && self.slots[id.0 as usize].armed
    }

    /// One tick for every armed timer; expired timers hand their event
    /// to `post` (the scheduler inbox).
    pub fn advance(&mut self, mut post: impl FnMut(EventRef)) {
        let mut cur = self.head;
        while cur != NIL {
            let next = self.slots[cur as usize].next;
            self.slots[cur as usize].counter -= 1;
            if self.slots[cur as usize].counter == 0 {
                if self.slots[cur as usize].interval > 0 {
                    self.slots[cur as usize].counter = self.slots[cur as usize].interval;
                    log::trace!("timer {} reloaded", cur);
                } else {
                    self.unlink(cur);
                    log::trace!("timer {} expired one-shot", cur);
                }
                if let Some(event) = self.slots[cur as usize].event {
                    post(event);
                }
            }
            cur = next;
        }
    }

    fn unlink(&mut self, idx: u16) {
        let (next, prev) = {
            let s = &self.slots[idx as usize];
            (s.next, s.prev)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        let slot = &mut self.slots[idx as usize];
        slot.armed = false;
        slot.next = NIL;
        slot.prev = NIL;
    }

    pub fn armed_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while cur != NIL {
            n += 1;
            cur = self.slots[cur as usize].next;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPool, SIG_USER};

    fn event(pool: &mut EventPool) -> EventRef {
        pool.create_static(SIG_USER, 1, 1).unwrap()
    }

    #[test]
    fn one_shot_fires_once_and_disarms() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e = event(&mut pool);
        bed.arm(TimerId(0), 3, 0, e).unwrap();
        let mut fired = 0;
        bed.advance(|_| fired += 1);
        bed.advance(|_| fired += 1);
        assert_eq!(fired, 0);
        bed.advance(|_| fired += 1);
        assert_eq!(fired, 1);
        assert!(!bed.is_armed(TimerId(0)));
        assert_eq!(bed.armed_count(), 0);
        // No further firing.
        bed.advance(|_| fired += 1);
        assert_eq!(fired, 1);
    }

    #[test]
    fn periodic_reloads() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e = event(&mut pool);
        bed.arm(TimerId(2), 2, 3, e).unwrap();
        let mut fired = 0;
        for _ in 0..8 {
            bed.advance(|_| fired += 1);
        }
        // Fires at ticks 2, 5, 8.
        assert_eq!(fired, 3);
        assert!(bed.is_armed(TimerId(2)));
    }

    #[test]
    fn arm_disarm_round_trip_leaves_bed_unchanged() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e = event(&mut pool);
        bed.arm(TimerId(1), 5, 0, e).unwrap();
        assert!(bed.disarm(TimerId(1)));
        assert!(!bed.disarm(TimerId(1)));
        assert_eq!(bed.armed_count(), 0);
        // Re-armable after the round trip.
        bed.arm(TimerId(1), 5, 0, e).unwrap();
        assert_eq!(bed.armed_count(), 1);
    }

    #[test]
    fn double_arm_is_a_fault() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e = event(&mut pool);
        bed.arm(TimerId(0), 1, 0, e).unwrap();
        assert_eq!(bed.arm(TimerId(0), 1, 0, e), Err(FaultKind::TimerMisuse));
        assert!(bed.arm(TimerId(1), 0, 0, e).is_err());
    }

    #[test]
    fn rearm_reports_expired_timer() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e = event(&mut pool);
        bed.arm(TimerId(0), 1, 0, e).unwrap();
        assert_eq!(bed.rearm(TimerId(0), 4, 0), Ok(true));
        for _ in 0..4 {
            bed.advance(|_| {});
        }
        // One-shot expired and auto-disarmed: rearm says so.
        assert_eq!(bed.rearm(TimerId(0), 2, 0), Ok(false));
    }

    #[test]
    fn same_tick_expirations_fire_in_list_order() {
        let mut pool = EventPool::new();
        let mut bed = TimerBed::new();
        let e0 = pool.create_static(10, 1, 1).unwrap();
        let e1 = pool.create_static(11, 1, 1).unwrap();
        bed.arm(TimerId(0), 1, 0, e0).unwrap();
        bed.arm(TimerId(1), 1, 0, e1).unwrap();
        let mut order = std::vec::Vec::new();
        bed.advance(|e| order.push(e));
        // Newest armed first in the list.
        assert_eq!(order, [e1, e0]);
    }
}
