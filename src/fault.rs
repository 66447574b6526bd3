//! Failure logging.
//!
//! Programming errors are not panics here: they are recorded as
//! `(kind, file, line, tick)` into a fixed ring and the runtime degrades
//! (drop the offending operation, reset scheduler context) rather than
//! halt. The scheduler periodically lifts records into a static fault
//! event so interested objects can observe them in-band.

use spin::Once;

use crate::config::FAULT_AMOUNT;

/// Classification of a recorded fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// A fixed-block pool ran out of slots.
    PoolExhausted,
    /// A handle did not refer to a live slot (stale generation, freed
    /// slot, or out of range): double-put or use-after-put.
    BadHandle,
    /// The chain cell pool ran out of cells.
    ChainExhausted,
    /// The nested-publication context stack was full.
    ContextOverflow,
    /// A context pop was attempted on an empty stack.
    ContextUnderflow,
    /// A state hierarchy exceeded `HSM_MAX_DEPTH`.
    DepthExceeded,
    /// A state machine structure was inconsistent (missing parent on the
    /// exit path, target unreachable).
    BadTopology,
    /// An entry, exit, do or action handler reported failure.
    HandlerFailure,
    /// A timer operation was misused (arm of an armed timer, zero count).
    TimerMisuse,
    /// The variable-size heap could not satisfy a request.
    HeapExhausted,
    /// A heap block handle was out of range or mis-tagged.
    HeapBadBlock,
    /// An argument violated a documented precondition.
    BadArgument,
}

/// One fault-log entry.
#[derive(Clone, Copy, Debug)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub file: &'static str,
    pub line: u32,
    /// Tick counter at record time.
    pub time: u32,
}

/// Fixed-capacity ring with overwrite-oldest policy. ISR-safe when the
/// caller brackets `record` with the port's interrupt gate (the runtime
/// does).
pub struct FaultLog {
    ring: [Option<FaultRecord>; FAULT_AMOUNT],
    head: usize,
    tail: usize,
}

impl FaultLog {
    pub const fn new() -> Self {
        Self {
            ring: [None; FAULT_AMOUNT],
            head: 0,
            tail: 0,
        }
    }

    /// Append a record, overwriting the oldest when full.
    pub fn record(&mut self, kind: FaultKind, file: &'static str, line: u32, time: u32) {
        log::warn!("fault {:?} at {}:{} tick {}", kind, file, line, time);
        self.ring[self.head] = Some(FaultRecord { kind, file, line, time });
        self.head = (self.head + 1) % FAULT_AMOUNT;
        if self.head == self.tail {
            // Ring full: drop the oldest.
            self.tail = (self.tail + 1) % FAULT_AMOUNT;
        }
        if let Some(hook) = ASSERT_HOOK.get() {
            hook(file, line);
        }
    }

    /// Take the oldest record, if any.
    pub fn take(&mut self) -> Option<FaultRecord> {
        if self.tail == self.head {
            return None;
        }
        let rec = self.ring[self.tail].take();
        self.tail = (self.tail + 1) % FAULT_AMOUNT;
        rec
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn len(&self) -> usize {
        (self.head + FAULT_AMOUNT - self.tail) % FAULT_AMOUNT
    }
}

/// Optional application callback invoked on every recorded fault, in
/// addition to the log entry. A bring-up build can install a halt here.
static ASSERT_HOOK: Once<fn(file: &'static str, line: u32)> = Once::new();

/// Install the assert callback. First installation wins; later calls are
/// ignored.
pub fn assert_hook(hook: fn(file: &'static str, line: u32)) {
    ASSERT_HOOK.call_once(|| hook);
}
