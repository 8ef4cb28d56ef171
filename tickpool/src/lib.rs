//! A concurrent node pool with ticket-based quiescent-state reclamation.
//!
//! Container implementations that churn through small, identically-sized
//! nodes want three things at once: allocation that is usually a pointer
//! bump off a thread-private list, the ability to hand memory freed on one
//! thread to allocations on another, and a guarantee that no stalled reader
//! ever sees a node's memory reused out from under it. This crate provides
//! that combination as a standalone building block:
//!
//! - [pool::MemoryPool] binds a private free list and a private retired list
//!   per participating thread to three shared lock-free queues of node
//!   batches (`free`, `empty`, `to_be_reclaimed`)
//! - [queue::GroupQueue] is the Michael & Scott queue those batches travel
//!   through, adapted so its retired dummies go back into circulation
//! - [gc::GcRoot] is the coordinator: a global transition ticket, one slot
//!   per thread, and the sweep that decides when a retired batch has aged
//!   past every live thread and may be reallocated
//!
//! ```text
//!                       free <------ to_be_reclaimed
//!                      /    \              ^
//!          splice out /      \ park shell  | bundle retired nodes
//!                    v        v            | at each sleep
//!     thread-local free      empty --------+
//!     and retired lists       (shell stock for bundles)
//! ```
//!
//! Threads opt in by attaching to the root and wrap every episode of pool
//! use in an [gc::AwakeGuard]; dropping the guard is the quiescence point
//! where that thread's frees are published and aged batches are recycled.
//! All of this is lock-free except the slow path into the system allocator.
//!
//! The crate is model-checked under [loom](https://docs.rs/loom): build with
//! `RUSTFLAGS="--cfg loom"` and run the `loom_*` tests.

pub mod gc;
mod loom_testing;
pub mod node;
pub mod pool;
pub mod queue;
mod util;

pub use gc::{AwakeGuard, GcGlobalGuard, GcRoot, GcThreadShard, MAX_THREADS};
pub use pool::{MemoryPool, PoolOptions};
