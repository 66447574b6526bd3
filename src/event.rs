//! Events: the only way anything in this runtime communicates.
//!
//! An event is an immutable-after-construction header: signal, urgency
//! (`priority`, lower is more urgent), preemption `threshold`, and an
//! opaque payload pointer the runtime neither reads nor frees. Dynamic
//! events come from the event pool and are recycled when their refcount
//! drops to zero; static events occupy a pool slot forever and survive
//! any number of deliveries.
//!
//! The refcount equals the number of chains currently holding the event
//! (scheduler inbox, subscriber event chains, defer chains). Binding
//! increments, consumption releases, deferral transfers.

use crate::config::EPOOL_AMOUNT;
use crate::mem::{Pool, Ref};

/// Application event identity. `0` is reserved for the fault event.
pub type Signal = u16;

/// Signal carried by the scheduler's static fault event.
pub const SIG_FAULT: Signal = 0;
/// First signal free for application use.
pub const SIG_USER: Signal = 1;

/// Priority floor: the scheduler sits at this level when no publication
/// group is active. Event priorities are clamped strictly below it so
/// every event can open a group.
pub const PRIO_FLOOR: u16 = u16::MAX;

/// Event header. Handlers receive a copy; the pooled original is only
/// touched through [`EventPool`].
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub signal: Signal,
    /// Urgency; lower values are served first. `0` is highest.
    pub priority: u16,
    /// Maximum priority value that may preempt this event's handling;
    /// `threshold <= priority`.
    pub threshold: u16,
    /// Opaque payload. The runtime never dereferences or frees it.
    pub record: *const (),
    refs: u16,
    stat: bool,
}

impl Event {
    /// Reinterpret the payload pointer. The caller guarantees the
    /// pointee type and lifetime; the runtime carried the pointer
    /// untouched from the producer.
    ///
    /// # Safety
    /// `record` must point to a live `T` for the duration of the borrow.
    pub unsafe fn record_as<T>(&self) -> Option<&T> {
        (self.record as *const T).as_ref()
    }

    /// Current reference count (number of chains holding the event).
    #[inline]
    pub fn refs(&self) -> u16 {
        self.refs
    }

    /// `true` for statically allocated events that are never recycled.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.stat
    }
}

impl Event {
    /// Bare header for engine-level tests, bypassing the pool.
    #[cfg(test)]
    pub(crate) fn synth(signal: Signal) -> Event {
        Event {
            signal,
            priority: 0,
            threshold: 0,
            record: core::ptr::null(),
            refs: 0,
            stat: false,
        }
    }
}

/// Handle to a pooled event.
pub type EventRef = Ref<Event>;

/// Outcome of a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// References remain; the count after the decrement.
    Live(u16),
    /// Last reference of a dynamic event; the slot was recycled.
    Recycled,
    /// Refcount reached zero but the event is static; nothing returned.
    Settled,
    /// The handle did not refer to a live event.
    Stale,
}

/// Fixed pool of event headers.
pub struct EventPool {
    pool: Pool<Event, EPOOL_AMOUNT>,
    statics: u16,
}

impl EventPool {
    pub fn new() -> Self {
        Self { pool: Pool::new(), statics: 0 }
    }

    fn make(signal: Signal, priority: u16, threshold: u16, stat: bool) -> Event {
        // Keep every event strictly below the idle floor and honor the
        // threshold <= priority contract.
        let priority = priority.min(PRIO_FLOOR - 1);
        let threshold = threshold.min(priority);
        Event { signal, priority, threshold, record: core::ptr::null(), refs: 0, stat }
    }

    /// Construct a dynamic event. `None` when the pool is out of blocks;
    /// the producer decides how to degrade.
    pub fn create(&mut self, signal: Signal, priority: u16, threshold: u16) -> Option<EventRef> {
        let r = self.pool.take(Self::make(signal, priority, threshold, false));
        if let Some(r) = r {
            log::trace!("event new sig={} prio={} {:?}", signal, priority, r);
        }
        r
    }

    /// Construct a static event: delivered like any other, never
    /// recycled. Typical producers are timers and the fault lifter.
    pub fn create_static(
        &mut self,
        signal: Signal,
        priority: u16,
        threshold: u16,
    ) -> Option<EventRef> {
        let made = self.pool.take(Self::make(signal, priority, threshold, true));
        if made.is_some() {
            self.statics += 1;
        }
        made
    }

    /// Increment the reference count. Returns `false` on a stale handle.
    pub fn retain(&mut self, r: EventRef) -> bool {
        match self.pool.get_mut(r) {
            Some(evt) => {
                evt.refs = evt.refs.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Drop one reference; recycle dynamic events at zero.
    pub fn release(&mut self, r: EventRef) -> Release {
        let Some(evt) = self.pool.get_mut(r) else {
            return Release::Stale;
        };
        evt.refs = evt.refs.saturating_sub(1);
        if evt.refs > 0 {
            return Release::Live(evt.refs);
        }
        if evt.stat {
            return Release::Settled;
        }
        log::trace!("event recycled {:?}", r);
        self.pool.put(r);
        Release::Recycled
    }

    /// Refcount-zero test: the event is not held by any chain.
    pub fn settled(&self, r: EventRef) -> bool {
        self.pool.get(r).map(|e| e.refs == 0).unwrap_or(false)
    }

    pub fn get(&self, r: EventRef) -> Option<&Event> {
        self.pool.get(r)
    }

    pub fn get_mut(&mut self, r: EventRef) -> Option<&mut Event> {
        self.pool.get_mut(r)
    }

    pub fn free(&self) -> u16 {
        self.pool.free()
    }

    pub fn margin(&self) -> u16 {
        self.pool.margin()
    }

    /// Every dynamic event is back in the pool. Static events occupy
    /// their slot forever and are not counted as leaked.
    pub fn all_recycled(&self) -> bool {
        self.pool.free() + self.statics >= self.pool.total()
    }
}
