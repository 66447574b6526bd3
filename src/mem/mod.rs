//! Deterministic memory: fixed-block pools and the segregated heap.
//!
//! Nothing here allocates from a global allocator; every byte is owned
//! by the embedding structure and accounted with low-watermarks so
//! pools can be sized from observed peak usage.

pub mod heap;
pub mod pool;

pub use heap::{Heap, HeapBlock};
pub use pool::{Pool, Ref};
