//! Subscription register.
//!
//! A priority-ordered chain of descriptors, one per distinct signal;
//! each descriptor owns a priority-ordered chain of subscribing agents.
//! Subscribe and unsubscribe must not be called from interrupt context:
//! the register is walked by the scheduler between steps, and the epoch
//! counter tells in-flight sweeps to restart after any mutation.

use arrayvec::ArrayVec;

use super::Core;
use crate::agent::AgentId;
use crate::chain::{Chain, Payload};
use crate::config::{AGENT_AMOUNT, DESC_AMOUNT};
use crate::event::{EventRef, Signal};
use crate::fault::FaultKind;
use crate::mem::Ref;

/// One registered signal: ordering priority (taken from the template
/// event that first subscribed it) and the subscriber chain.
pub struct Descriptor {
    pub(crate) signal: Signal,
    pub(crate) priority: u16,
    pub(crate) subs: Chain,
}

/// Handle to a pooled descriptor.
pub type DescRef = Ref<Descriptor>;

impl Core {
    /// Subscribe `id` to the signal carried by `event`. The register
    /// owns only the signal identity: the template event is released in
    /// every outcome. Duplicate subscriptions are no-ops.
    pub fn subscribe(&mut self, event: EventRef, id: AgentId) -> Result<(), FaultKind> {
        let Some(&header) = self.events.get(event) else {
            self.fault(FaultKind::BadHandle);
            return Err(FaultKind::BadHandle);
        };
        if self.agents.get(id.0 as usize).is_none() {
            self.release(event);
            self.fault(FaultKind::BadArgument);
            return Err(FaultKind::BadArgument);
        }
        let desc = match self.find_desc(header.signal) {
            Some(d) => d,
            None => {
                let Some(d) = self.descs.take(Descriptor {
                    signal: header.signal,
                    priority: header.priority,
                    subs: Chain::new(),
                }) else {
                    self.release(event);
                    self.fault(FaultKind::PoolExhausted);
                    return Err(FaultKind::PoolExhausted);
                };
                let bound = {
                    let Self { cells, enroll, .. } = self;
                    enroll.bind(cells, Payload::Entry(d), header.priority)
                };
                if let Err(kind) = bound {
                    self.descs.put(d);
                    self.release(event);
                    self.fault(kind);
                    return Err(kind);
                }
                d
            }
        };
        self.release(event);
        let prio = self.agents[id.0 as usize].prio;
        let bound = {
            let Self { cells, descs, .. } = self;
            match descs.get_mut(desc) {
                Some(entry) => entry.subs.bind_unique(cells, Payload::Agent(id), prio),
                None => Err(FaultKind::BadHandle),
            }
        };
        match bound {
            Ok(added) => {
                self.epoch = self.epoch.wrapping_add(1);
                if added {
                    log::debug!("signal {} subscribed by agent {}", header.signal, id.0);
                }
                Ok(())
            }
            Err(kind) => {
                self.fault(kind);
                Err(kind)
            }
        }
    }

    /// Remove `id` from the signal's subscriber chain; the descriptor is
    /// unbound when its chain empties. Releases the template event.
    pub fn unsubscribe(&mut self, event: EventRef, id: AgentId) -> Result<(), FaultKind> {
        let Some(signal) = self.events.get(event).map(|e| e.signal) else {
            self.fault(FaultKind::BadHandle);
            return Err(FaultKind::BadHandle);
        };
        self.release(event);
        let Some(desc) = self.find_desc(signal) else {
            self.fault(FaultKind::BadArgument);
            return Err(FaultKind::BadArgument);
        };
        self.desc_remove(desc, id);
        self.epoch = self.epoch.wrapping_add(1);
        log::debug!("signal {} unsubscribed by agent {}", signal, id.0);
        Ok(())
    }

    /// Remove `id` from every subscriber chain in the register.
    pub fn unsubscribe_all(&mut self, id: AgentId) {
        let mut entries: ArrayVec<DescRef, DESC_AMOUNT> = ArrayVec::new();
        if let Some(head) = self.enroll.head_ref(&self.cells) {
            let mut cur = head;
            loop {
                if let Some((Payload::Entry(d), _)) = Chain::at_ref(&self.cells, cur) {
                    let _ = entries.try_push(d);
                }
                match Chain::next_ref(&self.cells, cur) {
                    Some(next) if next != head => cur = next,
                    _ => break,
                }
            }
        }
        for desc in entries {
            self.desc_remove(desc, id);
        }
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn desc_remove(&mut self, desc: DescRef, id: AgentId) {
        let emptied = {
            let Self { cells, descs, .. } = self;
            match descs.get_mut(desc) {
                Some(entry) => {
                    entry.subs.unbind(cells, Payload::Agent(id));
                    entry.subs.is_empty()
                }
                None => false,
            }
        };
        if emptied {
            {
                let Self { cells, enroll, .. } = self;
                enroll.unbind(cells, Payload::Entry(desc));
            }
            self.descs.put(desc);
        }
    }

    /// Locate the descriptor for `signal`.
    pub(crate) fn find_desc(&self, signal: Signal) -> Option<DescRef> {
        let head = self.enroll.head_ref(&self.cells)?;
        let mut cur = head;
        loop {
            if let Some((Payload::Entry(d), _)) = Chain::at_ref(&self.cells, cur) {
                if self.descs.get(d).map(|e| e.signal) == Some(signal) {
                    return Some(d);
                }
            }
            cur = Chain::next_ref(&self.cells, cur)?;
            if cur == head {
                return None;
            }
        }
    }

    /// Number of live subscribers for a signal (diagnostics, sizing).
    pub fn subscriber_count(&self, signal: Signal) -> usize {
        match self.find_desc(signal) {
            Some(d) => self
                .descs
                .get(d)
                .map(|e| e.subs.len(&self.cells))
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Multicast: append `event` to every subscriber's event chain with
    /// one reference each. An event nobody subscribes to is released
    /// immediately. Returns the number of deliveries.
    pub fn publish(&mut self, event: EventRef) -> usize {
        let Some(signal) = self.events.get(event).map(|e| e.signal) else {
            self.fault(FaultKind::BadHandle);
            return 0;
        };
        match self.find_desc(signal) {
            Some(desc) => {
                let delivered = self.fan_out(desc, event);
                if delivered == 0 {
                    self.release(event);
                }
                delivered
            }
            None => {
                self.release(event);
                0
            }
        }
    }

    /// Deliver `event` to the subscribers of a known descriptor, one
    /// reference per delivery. Does not touch the caller's reference.
    pub(crate) fn fan_out(&mut self, desc: DescRef, event: EventRef) -> usize {
        let Some(priority) = self.events.get(event).map(|e| e.priority) else {
            self.fault(FaultKind::BadHandle);
            return 0;
        };
        let mut targets: ArrayVec<AgentId, AGENT_AMOUNT> = ArrayVec::new();
        if let Some(head) = self.desc_subs_head(desc) {
            let mut cur = head;
            loop {
                if let Some((Payload::Agent(id), _)) = Chain::at_ref(&self.cells, cur) {
                    let _ = targets.try_push(id);
                }
                match Chain::next_ref(&self.cells, cur) {
                    Some(next) if next != head => cur = next,
                    _ => break,
                }
            }
        }
        let port = self.port;
        let mut delivered = 0;
        for id in targets {
            let token = port.irq_save();
            let bound = {
                let Self { cells, agents, .. } = self;
                match agents.get_mut(id.0 as usize) {
                    Some(slot) => slot
                        .echain
                        .bind(cells, Payload::Event(event), priority)
                        .is_ok(),
                    None => false,
                }
            };
            if bound {
                self.events.retain(event);
                delivered += 1;
            }
            port.irq_restore(token);
            if bound {
                log::trace!("event {:?} delivered to agent {}", event, id.0);
            } else {
                self.fault(FaultKind::ChainExhausted);
            }
        }
        delivered
    }

    pub(crate) fn desc_subs_head(
        &self,
        desc: DescRef,
    ) -> Option<Ref<crate::chain::Cell>> {
        self.descs.get(desc)?.subs.head_ref(&self.cells)
    }
}
