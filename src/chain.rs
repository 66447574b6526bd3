//! Priority-ordered circular chains.
//!
//! Every queue in the runtime (scheduler inbox, per-object event and
//! defer chains, the subscription register and its subscriber lists)
//! is a circular doubly-linked chain of cells drawn from one global
//! cell pool. The head points at the smallest priority value. Equal
//! priorities keep insertion order: new entries land behind existing
//! ones, since insertion walks from the tail backwards.
//!
//! Cells link each other by raw slot index, which is valid exactly as
//! long as the cell stays linked. Cursors that survive across scheduler
//! steps use generational [`Ref`]s instead and are revalidated before
//! every use.

use crate::agent::AgentId;
use crate::config::CPOOL_AMOUNT;
use crate::event::EventRef;
use crate::fault::FaultKind;
use crate::mem::pool::NIL;
use crate::mem::{Pool, Ref};
use crate::sched::enroll::DescRef;

/// What a cell carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    Event(EventRef),
    Agent(AgentId),
    Entry(DescRef),
}

/// One chain cell.
pub struct Cell {
    next: u16,
    prev: u16,
    prio: u16,
    payload: Payload,
}

/// The global cell pool.
pub type CellPool = Pool<Cell, CPOOL_AMOUNT>;

/// A chain is just its head; an empty chain has no cells at all.
pub struct Chain {
    head: u16,
}

impl Chain {
    pub const fn new() -> Self {
        Self { head: NIL }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Insert by priority. Walks from the tail backwards so same- and
    /// lower-priority arrivals append in O(1).
    pub fn bind(
        &mut self,
        cells: &mut CellPool,
        payload: Payload,
        prio: u16,
    ) -> Result<(), FaultKind> {
        let idx = cells
            .take(Cell { next: NIL, prev: NIL, prio, payload })
            .ok_or(FaultKind::ChainExhausted)?
            .idx();
        if self.head == NIL {
            let cell = cells.at_mut(idx).expect("fresh cell");
            cell.next = idx;
            cell.prev = idx;
            self.head = idx;
            return Ok(());
        }
        let head = self.head;
        let (head_prio, tail) = {
            let h = cells.at(head).expect("chain head");
            (h.prio, h.prev)
        };
        if prio < head_prio {
            link_between(cells, idx, tail, head);
            self.head = idx;
        } else {
            let mut cur = tail;
            loop {
                if cur == head {
                    break;
                }
                let c = cells.at(cur).expect("linked cell");
                if prio >= c.prio {
                    break;
                }
                cur = c.prev;
            }
            let next = cells.at(cur).expect("linked cell").next;
            link_between(cells, idx, cur, next);
        }
        Ok(())
    }

    /// Insert unless `payload` is already present. Returns whether a new
    /// cell was linked.
    pub fn bind_unique(
        &mut self,
        cells: &mut CellPool,
        payload: Payload,
        prio: u16,
    ) -> Result<bool, FaultKind> {
        if self.find(cells, payload) {
            return Ok(false);
        }
        self.bind(cells, payload, prio)?;
        Ok(true)
    }

    /// Unlink and release the head cell.
    pub fn pop(&mut self, cells: &mut CellPool) -> Option<(Payload, u16)> {
        if self.head == NIL {
            return None;
        }
        let head = self.head;
        let (payload, prio, next, prev) = {
            let h = cells.at(head)?;
            (h.payload, h.prio, h.next, h.prev)
        };
        if next == head || prev == head {
            self.head = NIL;
        } else {
            if let Some(c) = cells.at_mut(next) {
                c.prev = prev;
            }
            if let Some(c) = cells.at_mut(prev) {
                c.next = next;
            }
            self.head = next;
        }
        if let Some(r) = cells.handle(head) {
            cells.put(r);
        }
        Some((payload, prio))
    }

    /// Head payload and priority without unlinking.
    pub fn peek(&self, cells: &CellPool) -> Option<(Payload, u16)> {
        let h = cells.at(self.head)?;
        Some((h.payload, h.prio))
    }

    pub fn find(&self, cells: &CellPool, payload: Payload) -> bool {
        self.find_idx(cells, payload).is_some()
    }

    fn find_idx(&self, cells: &CellPool, payload: Payload) -> Option<u16> {
        if self.head == NIL {
            return None;
        }
        let mut cur = self.head;
        loop {
            let c = cells.at(cur)?;
            if c.payload == payload {
                return Some(cur);
            }
            cur = c.next;
            if cur == self.head {
                return None;
            }
        }
    }

    /// Unlink the cell carrying `payload`. `false` when absent (a
    /// harmless no-op, matching unsubscribe semantics).
    pub fn unbind(&mut self, cells: &mut CellPool, payload: Payload) -> bool {
        let Some(idx) = self.find_idx(cells, payload) else {
            return false;
        };
        self.unlink(cells, idx);
        true
    }

    fn unlink(&mut self, cells: &mut CellPool, idx: u16) {
        let (next, prev) = match cells.at(idx) {
            Some(c) => (c.next, c.prev),
            None => return,
        };
        if next == idx || prev == idx {
            self.head = NIL;
        } else {
            if let Some(c) = cells.at_mut(next) {
                c.prev = prev;
            }
            if let Some(c) = cells.at_mut(prev) {
                c.next = next;
            }
            if self.head == idx {
                self.head = next;
            }
        }
        if let Some(r) = cells.handle(idx) {
            cells.put(r);
        }
    }

    pub fn len(&self, cells: &CellPool) -> usize {
        if self.head == NIL {
            return 0;
        }
        let mut n = 0;
        let mut cur = self.head;
        loop {
            n += 1;
            match cells.at(cur) {
                Some(c) => cur = c.next,
                None => break,
            }
            if cur == self.head {
                break;
            }
        }
        n
    }

    // ——— generational cursors (survive across scheduler steps) ———

    pub fn head_ref(&self, cells: &CellPool) -> Option<Ref<Cell>> {
        if self.head == NIL {
            None
        } else {
            cells.handle(self.head)
        }
    }

    /// Advance a cursor. `None` when the cursor went stale (its cell was
    /// unlinked since it was taken).
    pub fn next_ref(cells: &CellPool, cur: Ref<Cell>) -> Option<Ref<Cell>> {
        let next = cells.get(cur)?.next;
        cells.handle(next)
    }

    /// Payload and priority under a cursor, if still live.
    pub fn at_ref(cells: &CellPool, cur: Ref<Cell>) -> Option<(Payload, u16)> {
        let c = cells.get(cur)?;
        Some((c.payload, c.prio))
    }
}

fn link_between(cells: &mut CellPool, idx: u16, prev: u16, next: u16) {
    if let Some(c) = cells.at_mut(idx) {
        c.prev = prev;
        c.next = next;
    }
    if let Some(c) = cells.at_mut(prev) {
        c.next = idx;
    }
    if let Some(c) = cells.at_mut(next) {
        c.prev = idx;
    }
}
