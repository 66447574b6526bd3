//! AXON — event-driven active-object runtime for Cortex-M class targets.
//!
//! Long-lived agents ("active objects") communicate exclusively by
//! asynchronous events, each driven by a hierarchical or flat state
//! machine. The runtime provides a cooperative non-preemptive scheduler
//! with priority-based preemption of event handlers, deterministic
//! fixed-block pools for dynamic events, a publish/subscribe bus,
//! priority-ordered event and object chains, software timers and a
//! fault log with watchdog feeding.
//!
//! There are no threads, no blocking primitives and no hidden globals:
//! all state lives in a [`Runtime`] value the application places in a
//! `static`, and every handler runs to completion.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

pub mod agent;
pub mod chain;
pub mod config;
pub mod event;
pub mod fault;
pub mod mem;
pub mod port;
pub mod sched;
pub mod sm;
pub mod time;

pub use agent::{Active, Agent, AgentId, FsmActive, HsmActive, Progress};
pub use event::{Event, EventRef, Release, Signal, SIG_FAULT, SIG_USER};
pub use fault::{FaultKind, FaultRecord};
pub use port::{IrqToken, NullPort, Port};
pub use sched::{Core, Runtime};
pub use sm::fsm::{Flat, FlatReaction, Fsm};
pub use sm::hsm::{Hsm, Reaction, State};
pub use sm::{Dispatched, Machine, Phase};
pub use time::timer::TimerId;

/// Runtime version string, reported by [`Runtime::version`](sched::Runtime::version).
pub const VERSION: &str = concat!("AXON ", env!("CARGO_PKG_VERSION"));
