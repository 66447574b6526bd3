//! AXON compile-time configuration.
//!
//! Every structure these constants size lives inside [`Runtime`]; there
//! is no late allocation. Firmware forks pin them per project. Each
//! constant notes what exhausting it costs.
//!
//! [`Runtime`]: crate::sched::Runtime

/// Upper bound on the ancestor chain of any hierarchical state machine.
/// Sizes the transition entry-path stack; a deeper hierarchy is a
/// recorded fault and the transition is abandoned.
pub const HSM_MAX_DEPTH: usize = 16;

/// Chain cells globally available. Every link in every chain (scheduler
/// inbox, per-object event and defer chains, subscription register and
/// its subscriber lists) consumes one cell while linked.
pub const CPOOL_AMOUNT: usize = 128;

/// Event pool slots, shared by dynamic and static events. Static events
/// occupy their slot forever.
pub const EPOOL_AMOUNT: usize = 64;

/// Subscription descriptors: at most this many distinct signals can have
/// subscribers at once.
pub const DESC_AMOUNT: usize = 32;

/// Maximum number of attached active objects.
pub const AGENT_AMOUNT: usize = 16;

/// Depth of the scheduler's nested-publication context stack, in frames
/// of `(priority floor, group head, group cursor)`.
pub const MSTACK_AMOUNT: usize = 8;

/// Fault-log ring capacity; the oldest record is overwritten on overflow.
pub const FAULT_AMOUNT: usize = 32;

/// Software timer bed slots.
pub const TIMER_AMOUNT: usize = 16;

/// Number of power-of-two buckets in the variable-size heap (at most 32).
pub const HPOOL_AMOUNT: usize = 12;

/// Multiplier for heap bucket block sizes, in 4-byte units: bucket `i`
/// holds blocks of `(1 << i) * HPOOL_FACTOR * 4` bytes.
pub const HPOOL_FACTOR: usize = 1;

/// Bytes managed by the variable-size heap.
pub const HPOOL_SIZE: usize = 4096;

/// Advisory sizing for the application's debug sink ring buffer, bytes.
/// The runtime itself only emits through the `log` facade.
pub const DEBUG_BUFFER_SIZE: usize = 2 * 1024;

/// Ticks per second delivered by the platform tick source. Purely
/// informational; no runtime arithmetic depends on it.
pub const TICKER: u32 = 500;
